//! Remote endpoint and retry configuration

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A resolved remote cache endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    /// Directory the remote stores its data in
    pub root: PathBuf,

    /// Whether this remote accepts pushes
    pub push: bool,
}

impl RemoteSpec {
    /// Parse a remote URL. Only directory-backed remotes resolve in-tree;
    /// wire-protocol clients live outside this repository.
    pub fn parse(url: &str, push: bool) -> Result<Self> {
        let root = if let Some(path) = url.strip_prefix("file://") {
            PathBuf::from(path)
        } else if !url.contains("://") {
            PathBuf::from(url)
        } else {
            return Err(RemoteError::other(format!(
                "unsupported remote scheme in '{url}'; only file: remotes resolve here"
            )));
        };
        Ok(Self { root, push })
    }
}

/// Retry pacing for remote operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per operation
    pub max_attempts: u32,
    /// First backoff interval in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on the backoff interval in milliseconds
    pub max_backoff_ms: u64,
    /// Multiplier applied between attempts
    pub backoff_multiplier: f64,
    /// Per-call deadline in seconds
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    /// The per-call deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
