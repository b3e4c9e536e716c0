//! Grouping of translated instructions into FROM-delimited build stages.

use indexmap::IndexMap;

use crate::instruction::Instruction;
use crate::{Error, Result};

/// One stage of a multi-stage build.
///
/// A stage begins with (and includes) a `FROM` instruction and runs until the
/// next `FROM`. Immutable after [`Stages::split`]; the engine clones stages
/// before injecting synthetic LABEL/ENV instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// 0-based position in the script.
    pub index: usize,
    /// `AS` alias, or the stringified index when unnamed.
    pub name: String,
    /// The raw `FROM` target (image reference or earlier stage), unexpanded.
    pub base: String,
    /// `FROM --platform=` override, unexpanded.
    pub platform: Option<String>,
    /// The stage's instructions, `FROM` first.
    pub instructions: Vec<Instruction>,
}

impl Stage {
    /// Whether the stage consists of nothing but its `FROM` line.
    pub fn is_base_only(&self) -> bool {
        self.instructions.len() == 1
    }

    /// `(name, default)` pairs of every ARG declared inside this stage,
    /// in declaration order. Later declarations of a name win.
    pub fn declared_args(&self) -> IndexMap<String, Option<String>> {
        let mut args = IndexMap::new();
        for instruction in &self.instructions {
            if let Instruction::Arg(arg) = instruction {
                for (name, default) in &arg.pairs {
                    args.insert(name.clone(), default.clone());
                }
            }
        }
        args
    }
}

/// A whole script split into stages, plus the global (pre-FROM) ARGs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stages {
    /// ARGs declared before the first `FROM`, in declaration order.
    pub global_args: IndexMap<String, Option<String>>,
    /// The stages, in declaration order.
    pub stages: Vec<Stage>,
}

impl Stages {
    /// Splits a translated instruction list into stages.
    ///
    /// Instructions before the first `FROM` must all be `ARG`s; anything else
    /// is an error, as is a script with no `FROM` at all.
    pub fn split(instructions: Vec<Instruction>) -> Result<Self> {
        let mut global_args: IndexMap<String, Option<String>> = IndexMap::new();
        let mut stages: Vec<Stage> = Vec::new();

        for instruction in instructions {
            if let Instruction::From(from) = &instruction {
                let index = stages.len();
                stages.push(Stage {
                    index,
                    name: from.name.clone().unwrap_or_else(|| index.to_string()),
                    base: from.image.clone(),
                    platform: from.platform.clone(),
                    instructions: Vec::new(),
                });
            }
            match stages.last_mut() {
                Some(stage) => stage.instructions.push(instruction),
                None => match instruction {
                    Instruction::Arg(arg) => {
                        for (name, default) in &arg.pairs {
                            global_args.insert(name.clone(), default.clone());
                        }
                    }
                    other => {
                        return Err(Error::Malformed {
                            command: other.keyword().into(),
                            message: "instruction before the first FROM".into(),
                            original: other.original().into(),
                        });
                    }
                },
            }
        }

        if stages.is_empty() {
            return Err(Error::MissingFrom);
        }
        Ok(Self {
            global_args,
            stages,
        })
    }

    /// Looks up a stage by its `AS` name or stringified index.
    pub fn by_name(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|stage| stage.name == name || stage.index.to_string() == name)
    }

    /// The position of the stage named by `target`, or of the last stage
    /// when `target` is `None`. `Err` carries the unknown target back.
    pub fn target_index(&self, target: Option<&str>) -> std::result::Result<usize, String> {
        match target {
            None => Ok(self.stages.len() - 1),
            Some(name) => self
                .by_name(name)
                .map(|stage| stage.index)
                .ok_or_else(|| name.to_owned()),
        }
    }
}
