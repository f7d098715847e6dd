//! Filesystem-backed directory trees

use super::{join_rel, CasTree, FileListResult, ImportSource, NodeId};
use crate::error::{CasError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Fixed timestamp applied by [`FsDirectory::set_deterministic_mtime`]
const MAGIC_TIMESTAMP: u64 = 1_321_009_871;

/// A virtual directory over a real filesystem path
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Wrap an existing directory path.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The underlying filesystem path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Walk into a subdirectory, optionally creating missing levels.
    pub fn descend(&self, components: &[&str], create: bool) -> Result<Self> {
        let mut current = self.root.clone();

        for component in components {
            if component.is_empty() {
                continue;
            }
            let next = current.join(component);
            match fs::symlink_metadata(&next) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(CasError::NotADirectory {
                        path: next.to_string_lossy().into_owned(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if create {
                        fs::create_dir(&next)
                            .map_err(|e| CasError::io("create_dir", next.clone(), e))?;
                    } else {
                        return Err(CasError::MissingPath {
                            path: next.to_string_lossy().into_owned(),
                        });
                    }
                }
                Err(e) => return Err(CasError::io("symlink_metadata", next.clone(), e)),
            }
            current = next;
        }

        Ok(Self { root: current })
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let mut entries = fs::read_dir(&self.root)
            .map_err(|e| CasError::io("read_dir", self.root.clone(), e))?;
        Ok(entries.next().is_none())
    }

    /// All leaf-reachable relative paths, deterministic order.
    pub fn list_relative_paths_sorted(&self) -> Result<Vec<String>> {
        list_relative_paths(&self.root)
    }

    /// Merge files, directories and symlinks from `source` into this
    /// directory, applying the same overlay rule as the CAS variant.
    pub fn import(
        &self,
        source: ImportSource<'_>,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<FileListResult> {
        match source {
            ImportSource::Fs(path) => {
                let mut files = list_relative_paths(path)?;
                if let Some(filter) = filter {
                    files.retain(|f| filter(f));
                }
                let mut result = FileListResult::default();
                for f in &files {
                    self.import_fs_entry(path, f, &mut result)?;
                }
                Ok(result)
            }
            ImportSource::Cas(tree, node) => {
                let mut files = tree.list_relative_paths(node)?;
                if let Some(filter) = filter {
                    files.retain(|f| filter(f));
                }
                let mut result = FileListResult::default();
                for f in &files {
                    self.import_cas_entry(tree, node, f, &mut result)?;
                }
                Ok(result)
            }
        }
    }

    /// Overlay check for one destination path. Returns whether the import
    /// of that entry should proceed.
    fn check_replacement(&self, rel: &str, result: &mut FileListResult) -> Result<bool> {
        let dest = self.root.join(rel);
        match fs::symlink_metadata(&dest) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(CasError::io("symlink_metadata", dest, e)),
            Ok(meta) if meta.is_dir() && !meta.file_type().is_symlink() => {
                let mut entries =
                    fs::read_dir(&dest).map_err(|e| CasError::io("read_dir", dest.clone(), e))?;
                if entries.next().is_none() {
                    fs::remove_dir(&dest).map_err(|e| CasError::io("remove_dir", dest, e))?;
                    result.overwritten.push(rel.to_string());
                    Ok(true)
                } else {
                    result.ignored.push(rel.to_string());
                    Ok(false)
                }
            }
            Ok(_) => {
                fs::remove_file(&dest).map_err(|e| CasError::io("remove_file", dest, e))?;
                result.overwritten.push(rel.to_string());
                Ok(true)
            }
        }
    }

    fn prepare_parent(&self, rel: &str) -> Result<()> {
        if let Some((dir, _)) = rel.rsplit_once('/') {
            let parent = self.root.join(dir);
            fs::create_dir_all(&parent)
                .map_err(|e| CasError::io("create_dir_all", parent, e))?;
        }
        Ok(())
    }

    fn import_fs_entry(&self, src: &Path, rel: &str, result: &mut FileListResult) -> Result<()> {
        let src_path = src.join(rel);
        let meta = fs::symlink_metadata(&src_path)
            .map_err(|e| CasError::io("symlink_metadata", src_path.clone(), e))?;
        self.prepare_parent(rel)?;
        let dest = self.root.join(rel);

        if meta.file_type().is_symlink() {
            if self.check_replacement(rel, result)? {
                let target = fs::read_link(&src_path)
                    .map_err(|e| CasError::io("read_link", src_path, e))?;
                make_symlink_fs(&target, &dest)?;
                result.files_written.push(rel.to_string());
            }
        } else if meta.is_dir() {
            let src_is_empty = fs::read_dir(&src_path)
                .map_err(|e| CasError::io("read_dir", src_path.clone(), e))?
                .next()
                .is_none();
            if src_is_empty {
                if self.check_replacement(rel, result)? {
                    fs::create_dir(&dest).map_err(|e| CasError::io("create_dir", dest, e))?;
                }
            } else if !dest.exists() {
                fs::create_dir(&dest).map_err(|e| CasError::io("create_dir", dest, e))?;
            }
        } else if meta.is_file() {
            if self.check_replacement(rel, result)? {
                fs::copy(&src_path, &dest).map_err(|e| CasError::io("copy", dest, e))?;
                result.files_written.push(rel.to_string());
            }
        }

        Ok(())
    }

    fn import_cas_entry(
        &self,
        tree: &mut CasTree,
        node: NodeId,
        rel: &str,
        result: &mut FileListResult,
    ) -> Result<()> {
        use super::cas_tree::EntryKind;

        self.prepare_parent(rel)?;
        let dest = self.root.join(rel);

        match tree.lookup(node, rel)? {
            Some(EntryKind::File { digest, executable }) => {
                if self.check_replacement(rel, result)? {
                    let blob = tree.store().object_path(&digest)?;
                    fs::copy(&blob, &dest).map_err(|e| CasError::io("copy", dest.clone(), e))?;
                    super::cas_tree::apply_file_mode(&dest, executable)?;
                    result.files_written.push(rel.to_string());
                }
            }
            Some(EntryKind::Symlink { target }) => {
                if self.check_replacement(rel, result)? {
                    make_symlink_fs(Path::new(&target), &dest)?;
                    result.files_written.push(rel.to_string());
                }
            }
            Some(EntryKind::Directory) => {
                let child = tree.descend_path(node, rel, false)?;
                if tree.is_empty(child) {
                    if self.check_replacement(rel, result)? {
                        fs::create_dir(&dest)
                            .map_err(|e| CasError::io("create_dir", dest, e))?;
                    }
                } else if !dest.exists() {
                    fs::create_dir(&dest).map_err(|e| CasError::io("create_dir", dest, e))?;
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Copy (or rename, when allowed) everything into `to_directory`.
    pub fn export_to(&self, to_directory: &Path, can_destroy: bool) -> Result<()> {
        if can_destroy && fs::rename(&self.root, to_directory).is_ok() {
            return Ok(());
        }

        fs::create_dir_all(to_directory)
            .map_err(|e| CasError::io("create_dir_all", to_directory.to_path_buf(), e))?;
        let dest = Self::new(to_directory);
        dest.import(ImportSource::Fs(&self.root), None)?;
        Ok(())
    }

    /// Rewrite every mtime below the root to a fixed timestamp.
    pub fn set_deterministic_mtime(&self) -> Result<()> {
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(MAGIC_TIMESTAMP);
        for entry in walkdir::WalkDir::new(&self.root).contents_first(true) {
            let entry = entry.map_err(|e| {
                CasError::io(
                    "walk",
                    self.root.clone(),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walkdir error")),
                )
            })?;
            if entry.file_type().is_symlink() {
                continue;
            }
            let file = fs::OpenOptions::new()
                .read(true)
                .open(entry.path())
                .map_err(|e| CasError::io("open", entry.path().to_path_buf(), e))?;
            file.set_modified(stamp)
                .map_err(|e| CasError::io("set_modified", entry.path().to_path_buf(), e))?;
        }
        Ok(())
    }

    /// Chown everything below the root to the current user.
    #[cfg(unix)]
    pub fn set_deterministic_user(&self) -> Result<()> {
        // Safety note: geteuid/getegid are trivially safe libc calls.
        #[allow(unsafe_code)]
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };

        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                CasError::io(
                    "walk",
                    self.root.clone(),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walkdir error")),
                )
            })?;
            let path = entry.path();
            let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| CasError::MissingPath {
                    path: path.to_string_lossy().into_owned(),
                })?;
            #[allow(unsafe_code)]
            let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
            if rc != 0 {
                return Err(CasError::io(
                    "lchown",
                    path.to_path_buf(),
                    std::io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    /// Chown is a no-op on non-unix platforms.
    #[cfg(not(unix))]
    pub fn set_deterministic_user(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink_fs(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| CasError::io("symlink", link.to_path_buf(), e))
}

#[cfg(not(unix))]
fn make_symlink_fs(_target: &Path, link: &Path) -> Result<()> {
    Err(CasError::io(
        "symlink",
        link.to_path_buf(),
        std::io::Error::other("symlinks unsupported on this platform"),
    ))
}

/// Walk a real directory and return its relative paths in the same
/// deterministic order the CAS variant produces: per directory, symlinks
/// resolving to directories first, then file-like entries (or the
/// directory itself when it holds none), then subdirectories recursively.
pub fn list_relative_paths(directory: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    walk_into(directory, "", &mut out)?;
    Ok(out)
}

fn walk_into(dir: &Path, relpath: &str, out: &mut Vec<String>) -> Result<()> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| CasError::io("read_dir", dir.to_path_buf(), e))? {
        let entry = entry.map_err(|e| CasError::io("read_dir_entry", dir.to_path_buf(), e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    let mut file_like: Vec<String> = Vec::new();
    let mut dirs: Vec<String> = Vec::new();

    for name in &names {
        let path = dir.join(name);
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| CasError::io("symlink_metadata", path.clone(), e))?;
        if meta.file_type().is_symlink() {
            // Symlinks to directories count as directories but are not
            // followed; symlinks to files or broken links count as files.
            match fs::metadata(&path) {
                Ok(target) if target.is_dir() => out.push(join_rel(relpath, name)),
                _ => file_like.push(name.clone()),
            }
        } else if meta.is_dir() {
            dirs.push(name.clone());
        } else {
            file_like.push(name.clone());
        }
    }

    if file_like.is_empty() && !relpath.is_empty() {
        out.push(relpath.to_string());
    } else {
        for name in file_like {
            out.push(join_rel(relpath, &name));
        }
    }

    for name in dirs {
        let sub_relpath = join_rel(relpath, &name);
        walk_into(&dir.join(&name), &sub_relpath, out)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_source() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), b"x\n").unwrap();
        fs::create_dir(tmp.path().join("bin")).unwrap();
        fs::write(tmp.path().join("bin/hello"), b"#!/bin/sh\n").unwrap();
        fs::create_dir(tmp.path().join("empty")).unwrap();
        tmp
    }

    #[test]
    fn listing_matches_cas_ordering() {
        let src = setup_source();
        let listing = list_relative_paths(src.path()).unwrap();
        assert_eq!(listing, vec!["a", "bin/hello", "empty"]);
    }

    #[cfg(unix)]
    #[test]
    fn listing_includes_symlinks_without_following() {
        let src = setup_source();
        std::os::unix::fs::symlink("bin", src.path().join("binlink")).unwrap();
        std::os::unix::fs::symlink("a", src.path().join("alink")).unwrap();

        let listing = list_relative_paths(src.path()).unwrap();
        // binlink resolves to a directory: listed, not followed
        assert_eq!(listing, vec!["binlink", "a", "alink", "bin/hello", "empty"]);
    }

    #[test]
    fn descend_and_create() {
        let tmp = TempDir::new().unwrap();
        let dir = FsDirectory::new(tmp.path());

        let sub = dir.descend(&["x", "y"], true).unwrap();
        assert!(sub.path().is_dir());
        assert!(dir.descend(&["x", "missing"], false).is_err());

        fs::write(tmp.path().join("file"), b"f").unwrap();
        assert!(matches!(
            dir.descend(&["file"], false),
            Err(CasError::NotADirectory { .. })
        ));
    }

    #[test]
    fn import_copies_tree() {
        let src = setup_source();
        let dest_tmp = TempDir::new().unwrap();
        let dest = FsDirectory::new(dest_tmp.path());

        let result = dest.import(ImportSource::Fs(src.path()), None).unwrap();
        assert_eq!(result.files_written.len(), 2);
        assert!(dest_tmp.path().join("bin/hello").is_file());
        assert!(dest_tmp.path().join("empty").is_dir());
    }

    #[test]
    fn import_overlay_ignores_nonempty_dir_collision() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("col")).unwrap();

        let dest_tmp = TempDir::new().unwrap();
        fs::create_dir(dest_tmp.path().join("col")).unwrap();
        fs::write(dest_tmp.path().join("col/keep"), b"keep").unwrap();

        let dest = FsDirectory::new(dest_tmp.path());
        let result = dest.import(ImportSource::Fs(src.path()), None).unwrap();

        assert_eq!(result.ignored, vec!["col"]);
        assert!(dest_tmp.path().join("col/keep").is_file());
    }

    #[test]
    fn deterministic_mtime_applies_everywhere() {
        let src = setup_source();
        let dir = FsDirectory::new(src.path());
        dir.set_deterministic_mtime().unwrap();

        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(MAGIC_TIMESTAMP);
        let mtime = fs::metadata(src.path().join("bin/hello"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime, expected);
    }
}
