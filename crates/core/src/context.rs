//! The per-invocation context threaded through all components

use crate::config::Config;
use crate::error::{CoreError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Resolved per-invocation state.
///
/// Constructed once at startup from a [`Config`] and passed by reference
/// (or `Arc`) into caches, queues and jobs. There are no process-global
/// singletons; everything that needs configuration takes a context.
#[derive(Debug)]
pub struct CoreContext {
    /// The configuration this context was built from
    pub config: Config,

    /// Root of the local cache
    cache_dir: PathBuf,

    /// Cancellation handle for the whole invocation
    cancel: CancellationToken,
}

impl CoreContext {
    /// Create a context, resolving and creating the cache directory layout.
    pub fn new(config: Config) -> Result<Self> {
        let cache_dir = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("weir-cache"),
        };

        for sub in ["objects", "refs/heads", "tmp", "artifacts/refs", "logs"] {
            let dir = cache_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|e| CoreError::io(dir, e))?;
        }

        Ok(Self {
            config,
            cache_dir,
            cancel: CancellationToken::new(),
        })
    }

    /// Root of the local cache directory
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding artifact proto refs
    #[must_use]
    pub fn artifact_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts/refs")
    }

    /// Directory where job logs are preserved
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    /// The invocation-wide cancellation token
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of the whole invocation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_cache_layout() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            cache_dir: Some(tmp.path().join("cache")),
            ..Config::default()
        };
        let context = CoreContext::new(config).unwrap();

        assert!(context.cache_dir().join("objects").is_dir());
        assert!(context.cache_dir().join("refs/heads").is_dir());
        assert!(context.cache_dir().join("tmp").is_dir());
        assert!(context.artifact_dir().is_dir());
    }

    #[test]
    fn cancellation_propagates() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            cache_dir: Some(tmp.path().to_path_buf()),
            ..Config::default()
        };
        let context = CoreContext::new(config).unwrap();
        let token = context.cancellation().clone();

        assert!(!token.is_cancelled());
        context.cancel();
        assert!(token.is_cancelled());
    }
}
