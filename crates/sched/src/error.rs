//! Error types for the scheduler and queues

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;
use weir_artifact::ArtifactError;
use weir_cas::CasError;
use weir_core::CoreError;
use weir_graph::GraphError;
use weir_remote::RemoteError;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;

/// Errors raised while driving the pipeline
#[derive(Debug, Error, Diagnostic)]
pub enum SchedError {
    /// Graph or declaration problem
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    /// Artifact cache failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Artifact(#[from] ArtifactError),

    /// Local storage failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] CasError),

    /// Context or sandbox failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    /// A build command returned non-zero
    #[error("Build of '{element}' failed with exit status {exit_code}; log at {}", log_path.display())]
    #[diagnostic(
        code(weir::sched::build_failed),
        help("Inspect the preserved build log for the failing command's output")
    )]
    Build {
        /// The element that failed
        element: String,
        /// Exit status of the failing command
        exit_code: i32,
        /// Where the build log was preserved
        log_path: PathBuf,
    },

    /// Invariant violation inside the scheduler
    #[error("Internal scheduler error: {0}")]
    #[diagnostic(code(weir::sched::internal))]
    Internal(String),
}

impl SchedError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry at the job level could help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Artifact(ArtifactError::Remote(e)) => {
                e.is_retryable() || matches!(e, RemoteError::RetryExhausted { .. })
            }
            _ => false,
        }
    }
}
