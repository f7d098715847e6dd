//! Error types shared across the weir core

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the core context, key engine and sandbox contract
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    /// Invalid or missing user configuration
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(weir::core::load),
        help("Check the project configuration for typos or missing fields")
    )]
    Load(String),

    /// Cache key computation encountered unresolvable inputs
    #[error("Cannot compute cache key: {0}")]
    #[diagnostic(code(weir::core::cache_key))]
    CacheKey(String),

    /// A build command returned a non-zero exit status
    #[error("Command '{command}' failed with exit status {exit_code}")]
    #[diagnostic(code(weir::core::build_failed))]
    Build {
        /// The command that failed
        command: String,
        /// Its exit status
        exit_code: i32,
    },

    /// The sandbox could not be set up or driven
    #[error("Sandbox error: {message}")]
    #[diagnostic(code(weir::core::sandbox))]
    Sandbox {
        /// What went wrong
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// I/O failure while preparing context directories
    #[error("I/O error at {}: {source}", path.display())]
    #[diagnostic(code(weir::core::io))]
    Io {
        /// Path the operation touched
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Create a configuration error
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    /// Create a cache key error
    pub fn cache_key(msg: impl Into<String>) -> Self {
        Self::CacheKey(msg.into())
    }

    /// Create a sandbox error without an I/O source
    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::Sandbox {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a sandbox error wrapping an I/O failure
    pub fn sandbox_io(msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::Sandbox {
            message: msg.into(),
            source: Some(source),
        }
    }

    /// Create an I/O error tied to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
