//! The artifact cache
//!
//! Manages named references to artifact records in the local store and
//! coordinates push/pull against configured remotes. Refs are touched on
//! use; `list_artifacts` returns them in LRU order, which is what the
//! eviction pass consumes.

use crate::artifact::{Artifact, ArtifactName};
use crate::error::{ArtifactError, Result};
use crate::quota::CacheUsage;
use globset::Glob;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weir_cas::{required_blobs, CasError, Digest, Directory, ObjectStore};
use weir_core::QuotaConfig;
use weir_remote::{retry_with_backoff, AssetRemote, RemoteError, RetryConfig};

/// Outcome of an eviction pass
#[derive(Debug, Default)]
pub struct EvictionResult {
    /// Refs removed, oldest first
    pub refs_removed: Vec<String>,
    /// Blobs swept after the refs were dropped
    pub blobs_removed: usize,
    /// Bytes freed by the sweep
    pub bytes_freed: u64,
}

/// Local artifact cache with optional remotes
pub struct ArtifactCache {
    store: Arc<ObjectStore>,
    remotes: Vec<Arc<dyn AssetRemote>>,
    retry: RetryConfig,
    usage: CacheUsage,
    cancel: CancellationToken,
}

impl ArtifactCache {
    /// Create a cache over a local store with no remotes configured.
    #[must_use]
    pub fn new(store: Arc<ObjectStore>, quota: &QuotaConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            remotes: Vec::new(),
            retry: RetryConfig::default(),
            usage: CacheUsage::new(quota),
            cancel,
        }
    }

    /// Register a remote endpoint, in priority order.
    pub fn add_remote(&mut self, remote: Arc<dyn AssetRemote>) {
        self.remotes.push(remote);
    }

    /// Override the retry pacing for remote operations.
    pub fn set_retry(&mut self, retry: RetryConfig) {
        self.retry = retry;
    }

    /// The local object store.
    #[must_use]
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Cache usage accounting.
    #[must_use]
    pub fn usage(&self) -> &CacheUsage {
        &self.usage
    }

    /// Whether any remote is configured.
    #[must_use]
    pub fn has_remotes(&self) -> bool {
        !self.remotes.is_empty()
    }

    /// Whether any push-enabled remote is configured.
    #[must_use]
    pub fn has_push_remotes(&self) -> bool {
        self.remotes.iter().any(|r| r.push_enabled())
    }

    ////////////////////////////////////////
    //           Local operations         //
    ////////////////////////////////////////

    /// Whether the artifact is available locally.
    #[must_use]
    pub fn contains(&self, name: &ArtifactName) -> bool {
        self.store.has_ref(&name.to_string())
    }

    /// Store an artifact record and write its ref.
    pub fn commit(&self, name: &ArtifactName, artifact: &Artifact) -> Result<Digest> {
        let digest = artifact.store(&self.store)?;
        self.store.set_ref(&name.to_string(), &digest)?;
        debug!(artifact = %name, digest = %digest, "Committed artifact");
        Ok(digest)
    }

    /// Resolve and load a locally cached artifact record.
    pub fn lookup(&self, name: &ArtifactName) -> Result<Artifact> {
        let ref_name = name.to_string();
        let digest = self.store.resolve_ref(&ref_name).map_err(|e| match e {
            CasError::RefNotFound { .. } => ArtifactError::not_found(&ref_name),
            other => other.into(),
        })?;
        Artifact::load(&self.store, &digest)
    }

    /// List artifact refs in LRU order, optionally filtered by a glob.
    pub fn list_artifacts(&self, glob: Option<&str>) -> Result<Vec<String>> {
        let matcher = match glob {
            Some(expr) => Some(
                Glob::new(expr)
                    .map_err(|e| ArtifactError::decode(format!("bad glob '{expr}': {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };

        Ok(self
            .store
            .list_refs()?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| matcher.as_ref().map_or(true, |m| m.is_match(name)))
            .collect())
    }

    /// Remove one artifact ref. Blobs are left for the next sweep.
    pub fn remove(&self, ref_name: &str) -> Result<()> {
        self.store.remove_ref(ref_name).map_err(|e| match e {
            CasError::RefNotFound { .. } => ArtifactError::not_found(ref_name),
            other => other.into(),
        })
    }

    /// Alias an existing artifact under an additional key.
    pub fn link_key(&self, name: &ArtifactName, new_key: &str) -> Result<()> {
        let new_name = ArtifactName::new(&name.project, &name.element, new_key);
        if self.contains(&new_name) {
            return Ok(());
        }
        let digest = self.store.resolve_ref(&name.to_string())?;
        self.store.set_ref(&new_name.to_string(), &digest)?;
        Ok(())
    }

    /// LRU-touch an artifact ref.
    pub fn update_mtime(&self, name: &ArtifactName) -> Result<()> {
        let ref_name = name.to_string();
        self.store.touch_ref(&ref_name).map_err(|e| match e {
            CasError::RefNotFound { .. } => ArtifactError::not_found(&ref_name),
            other => other.into(),
        })
    }

    ////////////////////////////////////////
    //               Push                 //
    ////////////////////////////////////////

    /// Push an artifact to every push-enabled remote.
    ///
    /// Returns whether any remote was updated. A full remote is skipped
    /// with a warning; pushing is never fatal to a build.
    pub async fn push(&self, name: &ArtifactName, artifact: &Artifact) -> Result<bool> {
        let artifact_digest = artifact.store(&self.store)?;
        let mut pushed = false;

        for remote in self.remotes.iter().filter(|r| r.push_enabled()) {
            debug!(artifact = %name, remote = %remote.describe(), "Pushing artifact data");

            match self.push_artifact_blobs(remote.as_ref(), artifact, &artifact_digest).await {
                Ok(()) => {}
                Err(ArtifactError::Remote(RemoteError::CacheTooFull)) => {
                    warn!(remote = %remote.describe(), "Remote is full, skipping push");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self
                .push_artifact_proto(remote.as_ref(), name, artifact, &artifact_digest)
                .await?
            {
                info!(artifact = %name, remote = %remote.describe(), "Pushed artifact");
                pushed = true;
            } else {
                debug!(remote = %remote.describe(), "Remote already has this artifact");
            }
        }

        Ok(pushed)
    }

    /// Upload the blob graph of an artifact: referenced directories first,
    /// then the record blob, public data and logs.
    async fn push_artifact_blobs(
        &self,
        remote: &dyn AssetRemote,
        artifact: &Artifact,
        artifact_digest: &Digest,
    ) -> Result<()> {
        if let Some(files) = &artifact.files {
            self.send_directory(remote, files).await?;
        }
        if let Some(buildtree) = &artifact.buildtree {
            // Build trees may have been evicted locally; that is not a
            // reason to fail the push of everything else.
            match self.send_directory(remote, buildtree).await {
                Ok(()) | Err(ArtifactError::Storage(CasError::NotFound { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        let mut blobs = vec![artifact_digest.clone()];
        blobs.extend(artifact.referenced_blobs());
        self.send_blobs(remote, &blobs).await
    }

    /// Publish the artifact record under its URNs, skipping when the
    /// remote already points at the same digest.
    async fn push_artifact_proto(
        &self,
        remote: &dyn AssetRemote,
        name: &ArtifactName,
        artifact: &Artifact,
        artifact_digest: &Digest,
    ) -> Result<bool> {
        let mut keys = vec![artifact.strong_key.clone()];
        if artifact.weak_key != artifact.strong_key {
            keys.push(artifact.weak_key.clone());
        }
        let uris: Vec<String> = keys
            .iter()
            .map(|key| ArtifactName::new(&name.project, &name.element, key).urn())
            .collect();

        let existing = retry_with_backoff(&self.retry, &self.cancel, "fetch_reference", || {
            remote.fetch_reference(&uris)
        })
        .await?;
        if existing.as_ref() == Some(artifact_digest) {
            return Ok(false);
        }

        // Only reference directories we actually hold locally; the remote
        // verifies completeness of everything referenced.
        let referenced_directories: Vec<Digest> = artifact
            .referenced_directories()
            .into_iter()
            .filter(|d| self.store.contains(d))
            .collect();
        let referenced_blobs = artifact.referenced_blobs();

        retry_with_backoff(&self.retry, &self.cancel, "push_reference", || {
            remote.push_reference(
                &uris,
                artifact_digest,
                &referenced_blobs,
                &referenced_directories,
            )
        })
        .await?;

        Ok(true)
    }

    /// Upload every blob of a directory closure the remote is missing.
    async fn send_directory(&self, remote: &dyn AssetRemote, root: &Digest) -> Result<()> {
        let required = required_blobs(&self.store, root)?;
        self.send_blobs(remote, &required).await
    }

    async fn send_blobs(&self, remote: &dyn AssetRemote, digests: &[Digest]) -> Result<()> {
        let missing = retry_with_backoff(&self.retry, &self.cancel, "missing_blobs", || {
            remote.missing_blobs(digests)
        })
        .await?;

        for digest in &missing {
            let bytes = self.store.read(digest)?;
            retry_with_backoff(&self.retry, &self.cancel, "upload_blob", || {
                remote.upload_blob(digest, &bytes)
            })
            .await?;
        }

        Ok(())
    }

    ////////////////////////////////////////
    //               Pull                 //
    ////////////////////////////////////////

    /// Try to pull an artifact from the configured remotes.
    ///
    /// Returns whether an artifact was downloaded. Misses are not errors;
    /// a remote failing mid-pull with a missing blob makes us move on to
    /// the next remote.
    pub async fn pull(&self, name: &ArtifactName, pull_buildtrees: bool) -> Result<bool> {
        let uri = name.urn();
        let mut errors: Vec<String> = Vec::new();
        let mut artifact_digest = None;

        for remote in &self.remotes {
            let uris = [uri.clone()];
            match retry_with_backoff(&self.retry, &self.cancel, "fetch_reference", || {
                remote.fetch_reference(&uris)
            })
            .await
            {
                Ok(Some(digest)) => {
                    artifact_digest = Some(digest);
                    break;
                }
                Ok(None) => {
                    debug!(artifact = %name, remote = %remote.describe(), "Remote does not have artifact");
                }
                Err(e) => {
                    warn!(remote = %remote.describe(), error = %e, "Could not query remote");
                    errors.push(e.to_string());
                }
            }
        }

        let Some(artifact_digest) = artifact_digest else {
            if errors.is_empty() {
                return Ok(false);
            }
            return Err(ArtifactError::PullFailed {
                name: name.to_string(),
                detail: errors.join("\n"),
            });
        };

        for remote in &self.remotes {
            match self
                .pull_artifact_storage(remote.as_ref(), &artifact_digest, pull_buildtrees)
                .await
            {
                Ok(()) => {
                    self.store.set_ref(&name.to_string(), &artifact_digest)?;
                    info!(artifact = %name, remote = %remote.describe(), "Pulled artifact");
                    return Ok(true);
                }
                Err(ArtifactError::Remote(RemoteError::BlobNotFound { digest })) => {
                    debug!(remote = %remote.describe(), blob = %digest, "Remote is missing a blob, trying next");
                }
                Err(e) => {
                    warn!(remote = %remote.describe(), error = %e, "Could not pull from remote");
                    errors.push(e.to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(false)
        } else {
            Err(ArtifactError::PullFailed {
                name: name.to_string(),
                detail: errors.join("\n"),
            })
        }
    }

    async fn pull_artifact_storage(
        &self,
        remote: &dyn AssetRemote,
        artifact_digest: &Digest,
        pull_buildtrees: bool,
    ) -> Result<()> {
        let bytes = retry_with_backoff(&self.retry, &self.cancel, "download_blob", || {
            remote.download_blob(artifact_digest)
        })
        .await?;
        self.store.put_bytes(&bytes)?;
        let artifact = Artifact::decode(&bytes)?;

        if let Some(files) = &artifact.files {
            self.fetch_directory(remote, files).await?;
        }
        if pull_buildtrees {
            if let Some(buildtree) = &artifact.buildtree {
                self.fetch_directory(remote, buildtree).await?;
            }
        }

        for blob in artifact.referenced_blobs() {
            if !self.store.contains(&blob) {
                let data = retry_with_backoff(&self.retry, &self.cancel, "download_blob", || {
                    remote.download_blob(&blob)
                })
                .await?;
                self.store.put_bytes(&data)?;
            }
        }

        Ok(())
    }

    /// Fetch a directory closure: directory blobs breadth-first, then any
    /// file blobs still missing locally.
    async fn fetch_directory(&self, remote: &dyn AssetRemote, root: &Digest) -> Result<()> {
        let mut file_blobs: Vec<Digest> = Vec::new();
        let mut queue: VecDeque<Digest> = VecDeque::from([root.clone()]);

        while let Some(dir_digest) = queue.pop_front() {
            let bytes = if self.store.contains(&dir_digest) {
                self.store.read(&dir_digest)?
            } else {
                let data = retry_with_backoff(&self.retry, &self.cancel, "download_blob", || {
                    remote.download_blob(&dir_digest)
                })
                .await?;
                self.store.put_bytes(&data)?;
                data
            };

            let directory =
                Directory::decode(&bytes).map_err(|e| ArtifactError::decode(e.to_string()))?;
            for file in directory.files {
                file_blobs.push(file.digest);
            }
            for subdir in directory.directories {
                queue.push_back(subdir.digest);
            }
        }

        for digest in file_blobs {
            if !self.store.contains(&digest) {
                let data = retry_with_backoff(&self.retry, &self.cancel, "download_blob", || {
                    remote.download_blob(&digest)
                })
                .await?;
                self.store.put_bytes(&data)?;
            }
        }

        Ok(())
    }

    /// Query remotes for an artifact without transferring anything.
    pub async fn check_remotes(&self, name: &ArtifactName) -> Result<bool> {
        let uris = [name.urn()];
        for remote in &self.remotes {
            let found = retry_with_backoff(&self.retry, &self.cancel, "fetch_reference", || {
                remote.fetch_reference(&uris)
            })
            .await?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    ////////////////////////////////////////
    //              Eviction              //
    ////////////////////////////////////////

    /// Measure real usage and, if over quota, evict oldest refs until the
    /// low watermark is met, sweeping unreachable blobs as refs drop.
    pub fn enforce_quota(&self) -> Result<EvictionResult> {
        let mut result = EvictionResult::default();
        let Some(quota) = self.usage.quota() else {
            return Ok(result);
        };
        let low = self.usage.low_watermark().unwrap_or(quota / 2);

        let mut measured = self.store.usage()?;
        self.usage.set_measured(measured);
        if measured <= quota {
            return Ok(result);
        }

        info!(measured, quota, "Cache over quota, evicting artifacts");
        let mut remaining: VecDeque<(String, SystemTime)> = self.store.list_refs()?.into();

        while measured > low {
            let Some((victim, _)) = remaining.pop_front() else {
                break;
            };
            self.store.remove_ref(&victim)?;
            debug!(artifact = %victim, "Evicted artifact ref");
            result.refs_removed.push(victim);

            let (roots, blobs) = self.protected_roots(remaining.iter().map(|(n, _)| n.as_str()))?;
            let swept = weir_cas::sweep(&self.store, &roots, &blobs)?;
            result.blobs_removed += swept.blobs_removed;
            result.bytes_freed += swept.bytes_freed;

            measured = self.store.usage()?;
        }

        self.usage.set_measured(measured);
        Ok(result)
    }

    /// Collect the directory roots and plain blobs reachable from a set of
    /// surviving refs.
    fn protected_roots<'a>(
        &self,
        refs: impl Iterator<Item = &'a str>,
    ) -> Result<(Vec<Digest>, Vec<Digest>)> {
        let mut roots = Vec::new();
        let mut blobs = Vec::new();

        for name in refs {
            let digest = match self.store.resolve_ref(name) {
                Ok(d) => d,
                Err(CasError::RefNotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            blobs.push(digest.clone());
            match Artifact::load(&self.store, &digest) {
                Ok(artifact) => {
                    roots.extend(artifact.referenced_directories());
                    blobs.extend(artifact.referenced_blobs());
                }
                // A ref to an already-swept record protects nothing more
                Err(ArtifactError::Storage(CasError::NotFound { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        Ok((roots, blobs))
    }
}
