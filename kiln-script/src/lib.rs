//! Parsed build-script data model for the kiln image build engine.
//!
//! The script parser itself is an external collaborator. It hands kiln a
//! [`Script`]: a flat tree whose children are raw instruction lines
//! ([`Node`]s). This crate owns everything downstream of that hand-off:
//!
//! ```text
//! Script (raw nodes from the parser)
//!  ├── Instruction::from_node   — one-time translation into typed variants
//!  ├── Stages::split            — group instructions into FROM-delimited stages
//!  └── expand                   — $VAR word expansion for FROM / --from targets
//! ```
//!
//! Instructions are immutable after translation; the engine never re-parses
//! source text at execution time.

mod expand;
mod instruction;
mod node;
mod stage;

pub use expand::expand;
pub use instruction::{
    Arg, FileCopy, From, Healthcheck, Instruction, Mount, MountKind, Run, ShellOrExec,
};
pub use node::{Heredoc, Node, Script};
pub use stage::{Stage, Stages};

/// Result type for script-model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from translating or grouping parsed build-script nodes.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The parser produced a command keyword this model does not recognize.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),

    /// An instruction line is structurally invalid (wrong arity, bad flag).
    #[error("{command}: {message}: {original}")]
    Malformed {
        /// Uppercased command keyword.
        command: String,
        /// What is wrong with the line.
        message: String,
        /// Original source text of the offending line.
        original: String,
    },

    /// A script did not begin with FROM (ignoring leading global ARGs).
    #[error("no build stages: script must begin with FROM")]
    MissingFrom,

    /// A `$`-substitution could not be expanded.
    #[error("bad substitution in {0:?}")]
    BadSubstitution(String),
}
