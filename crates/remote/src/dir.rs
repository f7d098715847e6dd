//! Directory-backed remote cache
//!
//! Serves `file:` remote specs and doubles as the remote used by the test
//! suite. Layout mirrors the local store: blobs under `objects/`, named
//! references under `refs/`. Fault-injection knobs make the transient and
//! remote-full paths exercisable.

use crate::asset::AssetRemote;
use crate::config::RemoteSpec;
use crate::error::{RemoteError, Result};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;
use weir_cas::{Digest, Directory};

#[derive(Debug, Default)]
struct FaultState {
    /// Fail this many upcoming operations with `Unavailable`
    fail_next: u32,
}

/// A remote cache stored in a plain directory
pub struct DirRemote {
    root: PathBuf,
    push: bool,
    /// Byte budget for uploaded blobs; exceeding it reports `CacheTooFull`
    capacity: Option<u64>,
    faults: Mutex<FaultState>,
}

impl DirRemote {
    /// Open (creating if needed) a directory remote from a spec.
    pub fn open(spec: &RemoteSpec) -> Result<Self> {
        for sub in ["objects", "refs"] {
            let dir = spec.root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| RemoteError::io(dir, e))?;
        }
        Ok(Self {
            root: spec.root.clone(),
            push: spec.push,
            capacity: None,
            faults: Mutex::new(FaultState::default()),
        })
    }

    /// Cap the total bytes this remote will accept.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Make the next `n` operations fail with `Unavailable`.
    pub fn inject_unavailable(&self, n: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_next = n;
        }
    }

    fn check_faults(&self) -> Result<()> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| RemoteError::other("fault state poisoned"))?;
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(RemoteError::unavailable("injected fault"));
        }
        Ok(())
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let hash = digest.hash();
        self.root.join("objects").join(&hash[0..2]).join(&hash[2..])
    }

    fn ref_path(&self, uri: &str) -> PathBuf {
        // URNs contain ':' which is not universally path-safe
        self.root.join("refs").join(uri.replace(':', "_"))
    }

    fn used_bytes(&self) -> u64 {
        let mut total = 0;
        let objects = self.root.join("objects");
        for entry in walk_files(&objects) {
            total += entry;
        }
        total
    }

    /// Verify the transitive closure of a directory exists on this remote.
    fn check_directory_complete(&self, digest: &Digest) -> Result<()> {
        let path = self.object_path(digest);
        let bytes = fs::read(&path).map_err(|_| RemoteError::blob_not_found(digest))?;
        let directory =
            Directory::decode(&bytes).map_err(|e| RemoteError::other(e.to_string()))?;

        for file in &directory.files {
            if !self.object_path(&file.digest).exists() {
                return Err(RemoteError::blob_not_found(&file.digest));
            }
        }
        for subdir in &directory.directories {
            self.check_directory_complete(&subdir.digest)?;
        }
        Ok(())
    }
}

fn walk_files(dir: &std::path::Path) -> Vec<u64> {
    let mut sizes = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return sizes;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sizes.extend(walk_files(&path));
        } else if let Ok(meta) = entry.metadata() {
            sizes.push(meta.len());
        }
    }
    sizes
}

#[async_trait]
impl AssetRemote for DirRemote {
    async fn fetch_reference(&self, uris: &[String]) -> Result<Option<Digest>> {
        self.check_faults()?;
        for uri in uris {
            let path = self.ref_path(uri);
            match fs::read_to_string(&path) {
                Ok(text) => {
                    let digest = Digest::parse(text.trim())
                        .map_err(|e| RemoteError::other(e.to_string()))?;
                    return Ok(Some(digest));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RemoteError::io(path, e)),
            }
        }
        Ok(None)
    }

    async fn push_reference(
        &self,
        uris: &[String],
        digest: &Digest,
        referenced_blobs: &[Digest],
        referenced_directories: &[Digest],
    ) -> Result<()> {
        self.check_faults()?;

        if !self.object_path(digest).exists() {
            return Err(RemoteError::blob_not_found(digest));
        }
        for blob in referenced_blobs {
            if !self.object_path(blob).exists() {
                return Err(RemoteError::blob_not_found(blob));
            }
        }
        for dir in referenced_directories {
            self.check_directory_complete(dir)?;
        }

        for uri in uris {
            let path = self.ref_path(uri);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| RemoteError::io(parent.to_path_buf(), e))?;
            }
            fs::write(&path, digest.to_string()).map_err(|e| RemoteError::io(path, e))?;
        }
        debug!(digest = %digest, refs = uris.len(), "Pushed reference");
        Ok(())
    }

    async fn has_blob(&self, digest: &Digest) -> Result<bool> {
        self.check_faults()?;
        Ok(self.object_path(digest).exists())
    }

    async fn upload_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        self.check_faults()?;

        if Digest::from_bytes(bytes) != *digest {
            return Err(RemoteError::DigestMismatch {
                expected: digest.to_string(),
            });
        }

        let path = self.object_path(digest);
        if path.exists() {
            return Ok(());
        }

        if let Some(capacity) = self.capacity {
            if self.used_bytes() + bytes.len() as u64 > capacity {
                return Err(RemoteError::CacheTooFull);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RemoteError::io(parent.to_path_buf(), e))?;
        }
        fs::write(&path, bytes).map_err(|e| RemoteError::io(path, e))
    }

    async fn download_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.check_faults()?;
        let path = self.object_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RemoteError::blob_not_found(digest)
            } else {
                RemoteError::io(path.clone(), e)
            }
        })
    }

    async fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        self.check_faults()?;
        Ok(digests
            .iter()
            .filter(|d| !self.object_path(d).exists())
            .cloned()
            .collect())
    }

    fn push_enabled(&self) -> bool {
        self.push
    }

    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote(push: bool) -> (TempDir, DirRemote) {
        let tmp = TempDir::new().unwrap();
        let spec = RemoteSpec {
            root: tmp.path().to_path_buf(),
            push,
        };
        let remote = DirRemote::open(&spec).unwrap();
        (tmp, remote)
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let (_tmp, remote) = remote(true);
        let digest = Digest::from_bytes(b"blob");

        assert!(!remote.has_blob(&digest).await.unwrap());
        remote.upload_blob(&digest, b"blob").await.unwrap();
        assert!(remote.has_blob(&digest).await.unwrap());
        assert_eq!(remote.download_blob(&digest).await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn upload_verifies_digest() {
        let (_tmp, remote) = remote(true);
        let wrong = Digest::from_bytes(b"other");
        assert!(matches!(
            remote.upload_blob(&wrong, b"blob").await,
            Err(RemoteError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_reference_is_a_miss() {
        let (_tmp, remote) = remote(false);
        let found = remote
            .fetch_reference(&["urn_test_missing".to_string()])
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn reference_round_trip() {
        let (_tmp, remote) = remote(true);
        let digest = Digest::from_bytes(b"proto");
        remote.upload_blob(&digest, b"proto").await.unwrap();

        let uri = "urn:fdc:example:artifact:proj/elem/abc".to_string();
        remote
            .push_reference(&[uri.clone()], &digest, &[], &[])
            .await
            .unwrap();

        assert_eq!(
            remote.fetch_reference(&[uri]).await.unwrap(),
            Some(digest)
        );
    }

    #[tokio::test]
    async fn push_reference_requires_referenced_blobs() {
        let (_tmp, remote) = remote(true);
        let digest = Digest::from_bytes(b"proto");
        remote.upload_blob(&digest, b"proto").await.unwrap();

        let missing = Digest::from_bytes(b"never uploaded");
        let result = remote
            .push_reference(&["urn:x".to_string()], &digest, &[missing], &[])
            .await;
        assert!(matches!(result, Err(RemoteError::BlobNotFound { .. })));
    }

    #[tokio::test]
    async fn capacity_limit_reports_full() {
        let (_tmp, remote) = remote(true);
        let remote = remote.with_capacity(4);

        let small = Digest::from_bytes(b"ok");
        remote.upload_blob(&small, b"ok").await.unwrap();

        let big = Digest::from_bytes(b"too large for the remote");
        assert!(matches!(
            remote.upload_blob(&big, b"too large for the remote").await,
            Err(RemoteError::CacheTooFull)
        ));
    }

    #[tokio::test]
    async fn injected_faults_surface_as_unavailable() {
        let (_tmp, remote) = remote(false);
        remote.inject_unavailable(1);

        let digest = Digest::from_bytes(b"x");
        assert!(matches!(
            remote.has_blob(&digest).await,
            Err(RemoteError::Unavailable { .. })
        ));
        // Fault consumed; next call succeeds
        assert!(!remote.has_blob(&digest).await.unwrap());
    }
}
