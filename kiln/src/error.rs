//! Error types for build operations.
//!
//! Errors keep their kind from the component that raised them; layers above
//! add stage/step context by wrapping, never by re-categorizing. Cleanup
//! failures attach to an otherwise-successful build only.

/// Alias for `Result<T, kiln::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the build engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Conflicting or invalid build options, rejected before any work.
    #[error("invalid build options: {0}")]
    Options(String),

    /// A referenced stage, image, or build context does not exist.
    #[error("{verb} {name:?}: no such stage, image, or build context")]
    Lookup {
        /// The instruction verb that referenced the name.
        verb: String,
        /// The offending name, verbatim.
        name: String,
    },

    /// A step failed while executing (run, commit, or copy).
    #[error("building at {step:?}: {message}")]
    Execution {
        /// Original text of the failing step.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// A stage failed; wraps the original cause with stage context.
    #[error("stage {stage:?}: {source}")]
    Stage {
        /// Stage name (alias or stringified index).
        stage: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Waiting on another stage that terminated with an error.
    #[error("waiting for stage {stage:?}: {message}")]
    StageDependency {
        /// The stage waited on.
        stage: String,
        /// The dependency's terminal error, rendered.
        message: String,
    },

    /// A collaborator (Runner or Store) reported a failure.
    #[error("{0}")]
    Driver(String),

    /// Cleanup failed. When the build itself succeeded this becomes the
    /// build's result; otherwise it wraps the primary failure.
    #[error("cleanup: {message}")]
    Cleanup {
        /// The first cleanup failure, rendered.
        message: String,
        /// The build's primary failure, if it had one.
        #[source]
        primary: Option<Box<Error>>,
    },

    /// The build was cancelled before this operation completed.
    #[error("build cancelled")]
    Cancelled,

    /// Script model error.
    #[error(transparent)]
    Script(#[from] kiln_script::Error),

    /// Image metadata or registry error.
    #[error(transparent)]
    Oci(#[from] kiln_oci::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an error with the stage that raised it.
    pub fn in_stage(stage: impl Into<String>, source: Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// An execution failure at a step.
    pub fn execution(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Execution {
            step: step.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error (or its stage wrapper) is a cancellation.
    ///
    /// Used to prefer an original cause over cancellation-induced errors
    /// when both race to terminate the build.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::Oci(kiln_oci::Error::Cancelled) => true,
            Self::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_preserves_kind() {
        let inner = Error::execution("RUN make", "exit status 2");
        let wrapped = Error::in_stage("builder", inner);
        let text = wrapped.to_string();
        assert!(text.contains("builder"));
        assert!(text.contains("RUN make"));
        assert!(!wrapped.is_cancelled());
    }

    #[test]
    fn cancellation_detected_through_wrappers() {
        let wrapped = Error::in_stage("builder", Error::Cancelled);
        assert!(wrapped.is_cancelled());
    }
}
