//! Error types and failure classification for remote caches

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors that can occur while talking to a remote cache.
///
/// `NotFound` is a cache miss rather than a failure; callers treat it as
/// data. `Unavailable` is transient and retried; `CacheTooFull` on push is
/// "remote full" and skipped without failing the build.
#[derive(Debug, Error, Diagnostic)]
pub enum RemoteError {
    /// The requested reference does not exist on the remote
    #[error("Reference not found on remote")]
    #[diagnostic(code(weir::remote::not_found))]
    NotFound,

    /// A referenced blob is missing mid-transfer
    #[error("Remote does not have blob {digest}")]
    #[diagnostic(code(weir::remote::blob_not_found))]
    BlobNotFound {
        /// Digest of the missing blob
        digest: String,
    },

    /// The remote cannot be reached right now
    #[error("Remote unavailable: {message}")]
    #[diagnostic(
        code(weir::remote::unavailable),
        help("The operation will be retried; check connectivity if it keeps failing")
    )]
    Unavailable {
        /// Transport-level detail
        message: String,
    },

    /// The remote has no space left for pushed blobs
    #[error("Remote cache is full")]
    #[diagnostic(code(weir::remote::cache_too_full))]
    CacheTooFull,

    /// The remote rejected our credentials or the operation
    #[error("Permission denied by remote: {message}")]
    #[diagnostic(code(weir::remote::permission_denied))]
    PermissionDenied {
        /// Rejection detail
        message: String,
    },

    /// An uploaded blob did not match its declared digest
    #[error("Blob digest mismatch during upload: expected {expected}")]
    #[diagnostic(code(weir::remote::digest_mismatch))]
    DigestMismatch {
        /// The digest the upload was declared under
        expected: String,
    },

    /// Local I/O while servicing the remote operation
    #[error("Remote I/O error at {}: {source}", path.display())]
    #[diagnostic(code(weir::remote::io))]
    Io {
        /// Path the operation touched
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// All retry attempts were consumed
    #[error("Operation '{operation}' failed after {attempts} attempts: {last_error}")]
    #[diagnostic(code(weir::remote::retry_exhausted))]
    RetryExhausted {
        /// Name of the operation
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Anything the classification above does not cover
    #[error("Remote error: {message}")]
    #[diagnostic(code(weir::remote::other))]
    Other {
        /// Error detail
        message: String,
    },
}

impl RemoteError {
    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a blob-not-found error
    pub fn blob_not_found(digest: impl std::fmt::Display) -> Self {
        Self::BlobNotFound {
            digest: digest.to_string(),
        }
    }

    /// Create an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a catch-all error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether retrying the operation could help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(RemoteError::unavailable("down").is_retryable());
        assert!(RemoteError::io("/p", std::io::Error::other("x")).is_retryable());

        assert!(!RemoteError::NotFound.is_retryable());
        assert!(!RemoteError::CacheTooFull.is_retryable());
        assert!(!RemoteError::blob_not_found("abc/1").is_retryable());
        assert!(!RemoteError::PermissionDenied {
            message: "no".into()
        }
        .is_retryable());
    }
}
