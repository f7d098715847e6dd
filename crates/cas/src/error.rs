//! Error types for the object store and virtual directories

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for CAS operations
pub type Result<T> = std::result::Result<T, CasError>;

/// Errors raised by local storage and directory-tree operations
#[derive(Debug, Error, Diagnostic)]
pub enum CasError {
    /// A blob is not present in the local store
    #[error("Object not found in local store: {digest}")]
    #[diagnostic(code(weir::cas::not_found))]
    NotFound {
        /// Digest of the missing blob
        digest: String,
    },

    /// A named ref does not exist
    #[error("Ref not found: {name}")]
    #[diagnostic(code(weir::cas::ref_not_found))]
    RefNotFound {
        /// The missing ref name
        name: String,
    },

    /// The filesystem holding the cache is out of space
    #[error("Local cache is full")]
    #[diagnostic(
        code(weir::cas::cache_full),
        help("Free disk space or lower the cache quota so eviction can run")
    )]
    CacheFull,

    /// Stored bytes no longer match their digest
    #[error("Corrupt blob in local store: {digest}")]
    #[diagnostic(
        code(weir::cas::corrupt_blob),
        help("Delete the object and re-fetch or rebuild it")
    )]
    CorruptBlob {
        /// Digest the blob was stored under
        digest: String,
    },

    /// A digest string failed validation
    #[error("Invalid digest: {0}")]
    #[diagnostic(code(weir::cas::invalid_digest))]
    InvalidDigest(String),

    /// A directory blob could not be decoded
    #[error("Failed to decode directory object: {message}")]
    #[diagnostic(code(weir::cas::decode))]
    Decode {
        /// Decoder error text
        message: String,
    },

    /// Local I/O failure
    #[error("I/O error during {operation} at {}", path.display())]
    #[diagnostic(code(weir::cas::io))]
    Io {
        /// Operation being attempted
        operation: &'static str,
        /// Path the operation touched
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A symlink target beginning with `/` was found while absolute
    /// resolution is disallowed
    #[error("'{name}' is an absolute symlink, which was disallowed during resolution")]
    #[diagnostic(code(weir::cas::absolute_symlink))]
    AbsoluteSymlink {
        /// Name of the offending symlink entry
        name: String,
    },

    /// Symlink resolution revisited an entry
    #[error("Infinite symlink loop found during resolution; first repeated element is '{name}'")]
    #[diagnostic(code(weir::cas::infinite_symlink))]
    InfiniteSymlink {
        /// First repeated symlink entry
        name: String,
    },

    /// A regular file was found where a directory was required
    #[error("Reached a file called '{name}' while traversing a path; cannot proceed")]
    #[diagnostic(code(weir::cas::unexpected_file))]
    UnexpectedFile {
        /// Name of the file blocking traversal
        name: String,
    },

    /// A path component exists but is not a directory
    #[error("Cannot descend into '{path}': not a directory")]
    #[diagnostic(code(weir::cas::not_a_directory))]
    NotADirectory {
        /// The offending path
        path: String,
    },

    /// A path component does not exist
    #[error("'{path}' not found")]
    #[diagnostic(code(weir::cas::missing_path))]
    MissingPath {
        /// The missing path
        path: String,
    },
}

impl CasError {
    /// Create an I/O error, translating out-of-space conditions into
    /// [`CasError::CacheFull`].
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        #[cfg(unix)]
        if source.raw_os_error() == Some(libc::ENOSPC) {
            return Self::CacheFull;
        }
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Create a not-found error for a digest
    pub fn not_found(digest: impl std::fmt::Display) -> Self {
        Self::NotFound {
            digest: digest.to_string(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}
