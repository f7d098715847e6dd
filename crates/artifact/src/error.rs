//! Error types for the artifact cache

use miette::Diagnostic;
use thiserror::Error;
use weir_cas::CasError;
use weir_remote::RemoteError;

/// Result type alias for artifact operations
pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Errors raised while managing or transferring artifacts
#[derive(Debug, Error, Diagnostic)]
pub enum ArtifactError {
    /// The named artifact is not in the local cache
    #[error("Couldn't find artifact: {name}")]
    #[diagnostic(code(weir::artifact::not_found))]
    NotFound {
        /// Artifact ref name
        name: String,
    },

    /// Local storage failed underneath the cache
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] CasError),

    /// A remote operation failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Remote(#[from] RemoteError),

    /// An artifact record could not be decoded
    #[error("Failed to decode artifact record: {message}")]
    #[diagnostic(code(weir::artifact::decode))]
    Decode {
        /// Decoder error text
        message: String,
    },

    /// Pulling failed on every configured remote
    #[error("Failed to pull artifact {name}")]
    #[diagnostic(code(weir::artifact::pull_failed))]
    PullFailed {
        /// Artifact ref name
        name: String,
        /// Collected per-remote failures
        detail: String,
    },
}

impl ArtifactError {
    /// Create a not-found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}
