//! Multi-stage container-image build engine.
//!
//! kiln consumes a parsed build script (via [`kiln_script`]) and drives
//! external collaborators to produce OCI or Docker-format images:
//!
//! ```text
//! BuildExecutor (build)
//!  ├── DependencyResolver (dag)   — FROM / --from / --mount=from edges
//!  ├── scheduler                  — weighted semaphore + per-stage wakeups
//!  └── StageExecutor (stage)      — one worker per stage
//!       ├── CopyEngine (copy)     — ADD/COPY semantics
//!       ├── VolumeManager (volume)— VOLUME preservation across RUN
//!       └── layer cache (cache)   — createdBy / cache keys / history match
//!
//! collaborators, behind narrow contracts (driver, kiln_oci::transport):
//!   Runner — executes instructions in a working container
//!   Store  — layer-addressed image storage
//!   Transport — registry pull/push
//! ```
//!
//! The engine owns no persistent state; everything durable lives in the
//! store. One [`BuildExecutor`](build::BuildExecutor) is created per
//! (script, platform-set) pair and is consumed by its `build` call.

#![allow(clippy::missing_docs_in_private_items)]

pub mod build;
pub mod cache;
pub mod copy;
pub mod dag;
pub mod driver;
mod error;
pub mod log;
pub mod options;
pub mod rusage;
pub mod source;
pub mod stage;
pub mod volume;

pub use build::{BuildExecutor, BuildResult};
pub use error::{Error, Result};
pub use options::BuildOptions;
