//! Garbage collection for unreachable blobs
//!
//! Ref eviction policy lives with the artifact cache; this module only
//! sweeps blobs that no surviving root reaches any more.

use crate::digest::Digest;
use crate::directory::required_blobs;
use crate::error::{CasError, Result};
use crate::store::ObjectStore;
use std::collections::HashSet;
use tracing::debug;

/// Result of a sweep operation
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Number of blobs removed
    pub blobs_removed: usize,
    /// Bytes freed
    pub bytes_freed: u64,
}

/// Remove every blob not reachable from the given roots.
///
/// `root_directories` are walked transitively; `extra_blobs` are plain
/// blobs (artifact records, logs, public data) protected as-is. Roots
/// whose directory blob is already gone are skipped rather than treated
/// as errors, so a sweep can run after partial eviction.
pub fn sweep(
    store: &ObjectStore,
    root_directories: &[Digest],
    extra_blobs: &[Digest],
) -> Result<GcResult> {
    let mut reachable: HashSet<String> = HashSet::new();

    for root in root_directories {
        match required_blobs(store, root) {
            Ok(blobs) => {
                for blob in blobs {
                    reachable.insert(blob.hash().to_string());
                }
            }
            Err(CasError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    for blob in extra_blobs {
        reachable.insert(blob.hash().to_string());
    }

    let mut result = GcResult::default();
    for (hash, size) in store.list_objects()? {
        if reachable.contains(&hash) {
            continue;
        }
        let digest = Digest::new(hash.clone(), size as i64)?;
        result.bytes_freed += store.remove_object(&digest)?;
        result.blobs_removed += 1;
        debug!(blob = %hash, size, "Removed unreachable blob");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirEntry, Directory};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn sweep_keeps_reachable_blobs() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();

        let kept_file = store.put_bytes(b"kept").unwrap();
        let orphan = store.put_bytes(b"orphan").unwrap();

        let mut entries = BTreeMap::new();
        entries.insert(
            "kept".to_string(),
            DirEntry::File {
                digest: kept_file.clone(),
                is_executable: false,
            },
        );
        let root = Directory::from_entries(&entries).store(&store).unwrap();

        let result = sweep(&store, &[root.clone()], &[]).unwrap();

        assert_eq!(result.blobs_removed, 1);
        assert!(store.contains(&kept_file));
        assert!(store.contains(&root));
        assert!(!store.contains(&orphan));
    }

    #[test]
    fn extra_blobs_are_protected() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();

        let log = store.put_bytes(b"log data").unwrap();
        let result = sweep(&store, &[], &[log.clone()]).unwrap();

        assert_eq!(result.blobs_removed, 0);
        assert!(store.contains(&log));
    }

    #[test]
    fn missing_roots_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let ghost = Digest::from_bytes(b"never stored directory");

        assert!(sweep(&store, &[ghost], &[]).is_ok());
    }
}
