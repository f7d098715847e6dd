//! CAS-backed directory trees
//!
//! A [`CasTree`] is an arena of directory nodes layered over the object
//! store. Subdirectories materialize lazily from their digests; any edit
//! invalidates cached digests up the parent chain, and [`CasTree::digest`]
//! re-serializes dirty directories bottom-up back into the store.

use super::{join_rel, FileListResult, ImportSource};
use crate::digest::Digest;
use crate::directory::{DirEntry, Directory};
use crate::error::{CasError, Result};
use crate::store::ObjectStore;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Handle to a directory node inside a [`CasTree`]
pub type NodeId = usize;

/// Public view of one directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A subdirectory
    Directory,
    /// A regular file
    File {
        /// Blob digest
        digest: Digest,
        /// Executable bit
        executable: bool,
    },
    /// A symlink
    Symlink {
        /// Target path
        target: String,
    },
}

#[derive(Debug, Clone)]
enum IndexEntry {
    Directory {
        child: Option<NodeId>,
        digest: Option<Digest>,
    },
    File {
        digest: Digest,
        executable: bool,
        modified: bool,
    },
    Symlink {
        target: String,
        modified: bool,
    },
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    entries: BTreeMap<String, IndexEntry>,
    digest: Option<Digest>,
}

/// A virtual directory tree backed by the object store
pub struct CasTree {
    store: Arc<ObjectStore>,
    nodes: Vec<Node>,
    root: NodeId,
}

impl CasTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            nodes: vec![Node {
                parent: None,
                entries: BTreeMap::new(),
                digest: None,
            }],
            root: 0,
        }
    }

    /// Open a tree rooted at an existing directory digest.
    pub fn open(store: Arc<ObjectStore>, digest: &Digest) -> Result<Self> {
        let mut tree = Self::new(store);
        tree.populate(tree.root, digest)?;
        tree.nodes[0].digest = Some(digest.clone());
        Ok(tree)
    }

    /// The root node of this tree.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The object store backing this tree.
    #[must_use]
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    fn populate(&mut self, node: NodeId, digest: &Digest) -> Result<()> {
        let directory = Directory::load(&self.store, digest)?;
        let entries = &mut self.nodes[node].entries;
        for d in directory.directories {
            entries.insert(
                d.name,
                IndexEntry::Directory {
                    child: None,
                    digest: Some(d.digest),
                },
            );
        }
        for f in directory.files {
            entries.insert(
                f.name,
                IndexEntry::File {
                    digest: f.digest,
                    executable: f.is_executable,
                    modified: false,
                },
            );
        }
        for s in directory.symlinks {
            entries.insert(
                s.name,
                IndexEntry::Symlink {
                    target: s.target,
                    modified: false,
                },
            );
        }
        Ok(())
    }

    /// Materialize the child node behind a directory entry.
    fn ensure_child(&mut self, node: NodeId, name: &str) -> Result<NodeId> {
        let entry = self.nodes[node].entries.get(name).cloned();
        match entry {
            Some(IndexEntry::Directory {
                child: Some(id), ..
            }) => Ok(id),
            Some(IndexEntry::Directory {
                child: None,
                digest: Some(digest),
            }) => {
                let id = self.nodes.len();
                self.nodes.push(Node {
                    parent: Some(node),
                    entries: BTreeMap::new(),
                    digest: Some(digest.clone()),
                });
                self.populate(id, &digest)?;
                self.nodes[node].entries.insert(
                    name.to_string(),
                    IndexEntry::Directory {
                        child: Some(id),
                        digest: None,
                    },
                );
                Ok(id)
            }
            _ => Err(CasError::NotADirectory {
                path: name.to_string(),
            }),
        }
    }

    /// Drop cached digests from `node` up to the root.
    fn invalidate(&mut self, node: NodeId) {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.nodes[id].digest.take().is_none() {
                // Already dirty; ancestors are dirty too.
                break;
            }
            current = self.nodes[id].parent;
        }
    }

    /// Find the root by following parent links.
    fn find_root_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            current = parent;
        }
        current
    }

    /// Add a fresh empty subdirectory; the name must not exist.
    fn add_directory(&mut self, node: NodeId, name: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(node),
            entries: BTreeMap::new(),
            digest: None,
        });
        self.nodes[node].entries.insert(
            name.to_string(),
            IndexEntry::Directory {
                child: Some(id),
                digest: None,
            },
        );
        self.invalidate(node);
        id
    }

    /// Remove an entry by name, if present.
    pub fn delete_entry(&mut self, node: NodeId, name: &str) {
        self.nodes[node].entries.remove(name);
        self.invalidate(node);
    }

    /// Insert (or replace) a file entry referring to a stored blob.
    pub fn add_file_entry(&mut self, node: NodeId, name: &str, digest: Digest, executable: bool, modified: bool) {
        self.nodes[node].entries.insert(
            name.to_string(),
            IndexEntry::File {
                digest,
                executable,
                modified,
            },
        );
        self.invalidate(node);
    }

    /// Insert (or replace) a symlink entry.
    pub fn add_symlink_entry(&mut self, node: NodeId, name: &str, target: String) {
        let modified = self.nodes[node].entries.contains_key(name);
        self.nodes[node].entries.insert(
            name.to_string(),
            IndexEntry::Symlink { target, modified },
        );
        self.invalidate(node);
    }

    /// Whether a directory node has no entries.
    #[must_use]
    pub fn is_empty(&self, node: NodeId) -> bool {
        self.nodes[node].entries.is_empty()
    }

    /// Walk into a subdirectory, optionally creating missing levels.
    ///
    /// Symlink components are resolved; a component that exists but is not
    /// traversable fails with `NotADirectory`, an absent component with
    /// `MissingPath` unless `create` is set.
    pub fn descend(&mut self, from: NodeId, path: &[&str], create: bool) -> Result<NodeId> {
        let mut current = from;

        for component in path {
            if component.is_empty() {
                continue;
            }

            let entry = self.nodes[current].entries.get(*component).cloned();
            match entry {
                Some(IndexEntry::Directory { .. }) => {
                    current = self.ensure_child(current, component)?;
                }
                Some(_) => {
                    let mut resolver = Resolver::new(true, create);
                    match resolver.resolve(self, current, component)? {
                        Resolved::Directory(id) => current = id,
                        _ => {
                            return Err(CasError::NotADirectory {
                                path: (*component).to_string(),
                            })
                        }
                    }
                }
                None => {
                    if create {
                        current = self.add_directory(current, component);
                    } else {
                        return Err(CasError::MissingPath {
                            path: (*component).to_string(),
                        });
                    }
                }
            }
        }

        Ok(current)
    }

    /// Convenience wrapper splitting a `/`-separated path.
    pub fn descend_path(&mut self, from: NodeId, path: &str, create: bool) -> Result<NodeId> {
        let components: Vec<&str> = path.split('/').collect();
        self.descend(from, &components, create)
    }

    /// Look up an entry by relative path without following symlinks on the
    /// final component.
    pub fn lookup(&mut self, from: NodeId, path: &str) -> Result<Option<EntryKind>> {
        let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some(last) = components.pop() else {
            return Ok(None);
        };

        let mut current = from;
        for component in components {
            match self.nodes[current].entries.get(component) {
                Some(IndexEntry::Directory { .. }) => {
                    current = self.ensure_child(current, component)?;
                }
                _ => return Ok(None),
            }
        }

        Ok(self.nodes[current].entries.get(last).map(|e| match e {
            IndexEntry::Directory { .. } => EntryKind::Directory,
            IndexEntry::File {
                digest, executable, ..
            } => EntryKind::File {
                digest: digest.clone(),
                executable: *executable,
            },
            IndexEntry::Symlink { target, .. } => EntryKind::Symlink {
                target: target.clone(),
            },
        }))
    }

    ////////////////////////////////////////
    //              Listing               //
    ////////////////////////////////////////

    /// All leaf-reachable relative paths in deterministic order.
    ///
    /// Empty directories are emitted as themselves. Symlinks resolving to
    /// directories list as directories; symlinks to files or broken chains
    /// list as files.
    pub fn list_relative_paths(&mut self, node: NodeId) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.list_paths_into(node, "", &mut out)?;
        Ok(out)
    }

    fn list_paths_into(&mut self, node: NodeId, relpath: &str, out: &mut Vec<String>) -> Result<()> {
        let names: Vec<String> = self.nodes[node].entries.keys().cloned().collect();

        let mut file_like: Vec<String> = Vec::new();
        let mut dirs: Vec<String> = Vec::new();

        // Symlinks come first so that imports stage them before paths
        // that may traverse them.
        for name in &names {
            if matches!(
                self.nodes[node].entries.get(name),
                Some(IndexEntry::Symlink { .. })
            ) {
                let mut resolver = Resolver::new(true, false);
                match resolver.resolve(self, node, name)? {
                    Resolved::Directory(_) => out.push(join_rel(relpath, name)),
                    _ => file_like.push(name.clone()),
                }
            }
        }

        for name in &names {
            match self.nodes[node].entries.get(name) {
                Some(IndexEntry::File { .. }) => file_like.push(name.clone()),
                Some(IndexEntry::Directory { .. }) => dirs.push(name.clone()),
                _ => {}
            }
        }

        if file_like.is_empty() && !relpath.is_empty() {
            out.push(relpath.to_string());
        } else {
            file_like.sort();
            for name in file_like {
                out.push(join_rel(relpath, &name));
            }
        }

        dirs.sort();
        for name in dirs {
            let child = self.ensure_child(node, &name)?;
            let sub_relpath = join_rel(relpath, &name);
            self.list_paths_into(child, &sub_relpath, out)?;
        }

        Ok(())
    }

    ////////////////////////////////////////
    //        Modification tracking       //
    ////////////////////////////////////////

    /// Clear the modified flag on every entry below `node`.
    pub fn mark_unmodified(&mut self, node: NodeId) {
        let names: Vec<String> = self.nodes[node].entries.keys().cloned().collect();
        for name in names {
            let child = match self.nodes[node].entries.get_mut(&name) {
                Some(IndexEntry::File { modified, .. } | IndexEntry::Symlink { modified, .. }) => {
                    *modified = false;
                    None
                }
                Some(IndexEntry::Directory { child, .. }) => *child,
                None => None,
            };
            if let Some(child) = child {
                self.mark_unmodified(child);
            }
        }
    }

    /// Relative paths changed since the last [`CasTree::mark_unmodified`].
    pub fn list_modified_paths(&mut self, node: NodeId) -> Result<Vec<String>> {
        let mut modified = Vec::new();
        for path in self.list_relative_paths(node)? {
            if self.path_is_modified(node, &path)? {
                modified.push(path);
            }
        }
        Ok(modified)
    }

    fn path_is_modified(&mut self, node: NodeId, path: &str) -> Result<bool> {
        let mut components: Vec<&str> = path.split('/').collect();
        let Some(last) = components.pop() else {
            return Ok(false);
        };

        let mut current = node;
        for component in components {
            match self.nodes[current].entries.get(component) {
                Some(IndexEntry::Directory { .. }) => {
                    current = self.ensure_child(current, component)?;
                }
                _ => return Ok(false),
            }
        }

        Ok(matches!(
            self.nodes[current].entries.get(last),
            Some(IndexEntry::File { modified: true, .. } | IndexEntry::Symlink { modified: true, .. })
        ))
    }

    /// Normalizing mtimes is a no-op: CAS trees store no timestamps.
    pub fn set_deterministic_mtime(&mut self) {}

    /// Normalizing ownership is a no-op: CAS trees store no owners.
    pub fn set_deterministic_user(&mut self) {}

    ////////////////////////////////////////
    //               Digest               //
    ////////////////////////////////////////

    /// Serialize dirty directories bottom-up and return this node's digest.
    pub fn digest(&mut self, node: NodeId) -> Result<Digest> {
        if let Some(digest) = &self.nodes[node].digest {
            return Ok(digest.clone());
        }

        let names: Vec<String> = self.nodes[node].entries.keys().cloned().collect();
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();

        for name in names {
            let entry = self.nodes[node]
                .entries
                .get(&name)
                .cloned()
                .ok_or_else(|| CasError::decode("entry vanished during digest"))?;
            let dir_entry = match entry {
                IndexEntry::Directory {
                    child: Some(child), ..
                } => DirEntry::Directory(self.digest(child)?),
                IndexEntry::Directory {
                    child: None,
                    digest: Some(digest),
                } => DirEntry::Directory(digest),
                IndexEntry::Directory {
                    child: None,
                    digest: None,
                } => return Err(CasError::decode("directory entry with no digest or child")),
                IndexEntry::File {
                    digest, executable, ..
                } => DirEntry::File {
                    digest,
                    is_executable: executable,
                },
                IndexEntry::Symlink { target, .. } => DirEntry::Symlink(target),
            };
            entries.insert(name, dir_entry);
        }

        let digest = Directory::from_entries(&entries).store(&self.store)?;
        self.nodes[node].digest = Some(digest.clone());
        Ok(digest)
    }

    ////////////////////////////////////////
    //               Import               //
    ////////////////////////////////////////

    /// Merge files, directories and symlinks from `source` into `dest`.
    ///
    /// The overlay rule: files and symlinks overwrite colliding entries;
    /// an incoming directory replaces a colliding *empty* directory but a
    /// collision with a non-empty directory is ignored and reported.
    pub fn import(
        &mut self,
        dest: NodeId,
        source: ImportSource<'_>,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<FileListResult> {
        match source {
            ImportSource::Fs(path) => {
                let mut files = super::fs_list_relative_paths(path)?;
                if let Some(filter) = filter {
                    files.retain(|f| filter(f));
                }
                self.import_fs_files(dest, path, &files, "")
            }
            ImportSource::Cas(src_tree, src_node) => {
                let mut files = src_tree.list_relative_paths(src_node)?;
                if let Some(filter) = filter {
                    files.retain(|f| filter(f));
                }
                self.import_cas_files(dest, src_tree, src_node, &files, "")
            }
        }
    }

    /// Check whether `name` may be overwritten in `dest`, recording the
    /// outcome. Returns true if the import of that entry should proceed.
    fn check_replacement(
        &mut self,
        dest: NodeId,
        name: &str,
        prefix: &str,
        result: &mut FileListResult,
    ) -> Result<bool> {
        let relative = join_rel(prefix, name);
        let entry = self.nodes[dest].entries.get(name).cloned();
        match entry {
            None => Ok(true),
            Some(IndexEntry::Directory { .. }) => {
                let subdir = self.ensure_child(dest, name)?;
                if self.is_empty(subdir) {
                    self.delete_entry(dest, name);
                    result.overwritten.push(relative);
                    Ok(true)
                } else {
                    result.ignored.push(relative);
                    Ok(false)
                }
            }
            Some(_) => {
                self.delete_entry(dest, name);
                result.overwritten.push(relative);
                Ok(true)
            }
        }
    }

    /// Delete whatever `name` is and put an empty directory in its place.
    fn replace_with_directory(
        &mut self,
        dest: NodeId,
        name: &str,
        prefix: &str,
        overwritten: &mut Vec<String>,
    ) -> NodeId {
        self.delete_entry(dest, name);
        overwritten.push(join_rel(prefix, name));
        self.add_directory(dest, name)
    }

    /// Make sure `name` in `dest` is (or resolves to) a directory that can
    /// be descended into, replacing files and broken links if needed.
    fn ensure_followable(
        &mut self,
        dest: NodeId,
        name: &str,
        prefix: &str,
        result: &mut FileListResult,
    ) -> Result<NodeId> {
        if matches!(
            self.nodes[dest].entries.get(name),
            Some(IndexEntry::Directory { .. })
        ) {
            return self.ensure_child(dest, name);
        }

        let mut resolver = Resolver::new(true, true);
        match resolver.resolve(self, dest, name) {
            Ok(Resolved::Directory(id)) => Ok(id),
            Ok(_) | Err(CasError::InfiniteSymlink { .. }) => {
                Ok(self.replace_with_directory(dest, name, prefix, &mut result.overwritten))
            }
            Err(e) => Err(e),
        }
    }

    fn import_fs_files(
        &mut self,
        dest: NodeId,
        src_dir: &Path,
        files: &[String],
        prefix: &str,
    ) -> Result<FileListResult> {
        let mut result = FileListResult::default();

        for entry in files {
            let relative = join_rel(prefix, entry);

            if let Some((dir_name, rest)) = entry.split_once('/') {
                // Delegate to the importer for that subdirectory. Entries
                // are handled one at a time; symlink imports change how
                // later paths resolve, so order matters.
                let subdir = if self.nodes[dest].entries.contains_key(dir_name) {
                    self.ensure_followable(dest, dir_name, prefix, &mut result)?
                } else {
                    self.add_directory(dest, dir_name)
                };
                let sub_prefix = join_rel(prefix, dir_name);
                let sub_result = self.import_fs_files(
                    subdir,
                    &src_dir.join(dir_name),
                    &[rest.to_string()],
                    &sub_prefix,
                )?;
                result.combine(sub_result);
                continue;
            }

            let import_path = src_dir.join(entry);
            let meta = fs::symlink_metadata(&import_path)
                .map_err(|e| CasError::io("symlink_metadata", import_path.clone(), e))?;

            if meta.file_type().is_symlink() {
                if self.check_replacement(dest, entry, prefix, &mut result)? {
                    let target = fs::read_link(&import_path)
                        .map_err(|e| CasError::io("read_link", import_path.clone(), e))?;
                    self.add_symlink_entry(dest, entry, target.to_string_lossy().into_owned());
                    result.files_written.push(relative);
                }
            } else if meta.is_dir() {
                // A directory listed as itself. If it is empty in the
                // source, the overlay rule applies: a colliding empty
                // directory is replaced, a non-empty one is left alone and
                // reported. Non-empty source directories merge via their
                // member entries instead.
                let src_is_empty = fs::read_dir(&import_path)
                    .map_err(|e| CasError::io("read_dir", import_path.clone(), e))?
                    .next()
                    .is_none();
                if src_is_empty {
                    if self.check_replacement(dest, entry, prefix, &mut result)? {
                        self.add_directory(dest, entry);
                    }
                } else if !self.nodes[dest].entries.contains_key(entry) {
                    self.add_directory(dest, entry);
                }
            } else if meta.is_file() {
                if self.check_replacement(dest, entry, prefix, &mut result)? {
                    let digest = self.store.put_path(&import_path)?;
                    let executable = is_executable(&meta);
                    let modified = result.overwritten.contains(&relative);
                    self.add_file_entry(dest, entry, digest, executable, modified);
                    result.files_written.push(relative);
                }
            }
        }

        Ok(result)
    }

    fn import_cas_files(
        &mut self,
        dest: NodeId,
        src: &mut CasTree,
        src_node: NodeId,
        files: &[String],
        prefix: &str,
    ) -> Result<FileListResult> {
        let mut result = FileListResult::default();
        let mut processed_directories: HashSet<String> = HashSet::new();

        for f in files {
            let fullname = join_rel(prefix, f);

            if let Some((dir_name, _)) = f.split_once('/') {
                if !processed_directories.contains(dir_name) {
                    let sub_files = files_in_subdir(files, dir_name);
                    let dest_subdir = if self.nodes[dest].entries.contains_key(dir_name) {
                        let mut resolver = Resolver::new(true, true);
                        match resolver.resolve(self, dest, dir_name)? {
                            Resolved::Directory(id) => id,
                            _ => self.replace_with_directory(
                                dest,
                                dir_name,
                                prefix,
                                &mut result.overwritten,
                            ),
                        }
                    } else {
                        self.descend(dest, &[dir_name], true)?
                    };
                    let src_subdir = src.descend(src_node, &[dir_name], false)?;
                    let sub_prefix = join_rel(prefix, dir_name);
                    let sub_result =
                        self.import_cas_files(dest_subdir, src, src_subdir, &sub_files, &sub_prefix)?;
                    result.combine(sub_result);
                }
                processed_directories.insert(dir_name.to_string());
                continue;
            }

            let src_entry = src.nodes[src_node].entries.get(f).cloned();
            match src_entry {
                Some(IndexEntry::Directory { .. }) => {
                    // A directory listed as itself. Empty source
                    // directories follow the overlay rule: replace a
                    // colliding empty directory, ignore (and report) a
                    // non-empty one. Non-empty source directories merge
                    // via their member entries instead.
                    let src_child = src.ensure_child(src_node, f)?;
                    if src.is_empty(src_child) {
                        if self.check_replacement(dest, f, prefix, &mut result)? {
                            self.add_directory(dest, f);
                        }
                    } else if !self.nodes[dest].entries.contains_key(f) {
                        self.add_directory(dest, f);
                    }
                }
                Some(IndexEntry::File {
                    digest, executable, ..
                }) => {
                    if self.check_replacement(dest, f, prefix, &mut result)? {
                        self.add_file_entry(dest, f, digest, executable, true);
                        result.files_written.push(fullname);
                    }
                }
                Some(IndexEntry::Symlink { target, .. }) => {
                    if self.check_replacement(dest, f, prefix, &mut result)? {
                        self.add_symlink_entry(dest, f, target);
                        result.files_written.push(fullname);
                    }
                }
                None => {
                    // The listing can include a directory that was emitted
                    // as itself (an empty dir); a vanished name is a bug in
                    // the source listing, ignore it.
                }
            }
        }

        Ok(result)
    }

    ////////////////////////////////////////
    //               Export               //
    ////////////////////////////////////////

    /// Materialize this node onto a real filesystem directory.
    pub fn export_to(&mut self, node: NodeId, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|e| CasError::io("create_dir_all", dest.to_path_buf(), e))?;

        let names: Vec<String> = self.nodes[node].entries.keys().cloned().collect();
        for name in names {
            let entry = self.nodes[node].entries.get(&name).cloned();
            let target_path = dest.join(&name);
            match entry {
                Some(IndexEntry::File {
                    digest, executable, ..
                }) => {
                    let src = self.store.object_path(&digest)?;
                    fs::copy(&src, &target_path)
                        .map_err(|e| CasError::io("copy", target_path.clone(), e))?;
                    apply_file_mode(&target_path, executable)?;
                }
                Some(IndexEntry::Symlink { target, .. }) => {
                    make_symlink(&target, &target_path)?;
                }
                Some(IndexEntry::Directory { .. }) => {
                    let child = self.ensure_child(node, &name)?;
                    self.export_to(child, &target_path)?;
                }
                None => {}
            }
        }

        Ok(())
    }
}

/// Filter `sorted_files` down to entries under `dir_name`, prefix removed.
fn files_in_subdir(sorted_files: &[String], dir_name: &str) -> Vec<String> {
    let prefix = format!("{dir_name}/");
    sorted_files
        .iter()
        .filter_map(|f| f.strip_prefix(&prefix).map(str::to_string))
        .collect()
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Apply the executable (or plain) permission set to an exported file.
#[cfg(unix)]
pub(crate) fn apply_file_mode(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CasError::io("set_permissions", path.to_path_buf(), e))
}

/// Apply the executable (or plain) permission set to an exported file.
#[cfg(not(unix))]
pub(crate) fn apply_file_mode(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| CasError::io("symlink", link.to_path_buf(), e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, link: &Path) -> Result<()> {
    Err(CasError::io(
        "symlink",
        link.to_path_buf(),
        std::io::Error::other("symlinks unsupported on this platform"),
    ))
}

////////////////////////////////////////
//          Symlink resolution        //
////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Directory(NodeId),
    File,
    NotFound,
}

/// Resolves names (possibly through symlink chains) inside a [`CasTree`].
///
/// Carries the two flags that are constant throughout one resolution and
/// the seen-set used to detect infinite symlink loops.
struct Resolver {
    absolute_symlinks_resolve: bool,
    force_create: bool,
    seen: HashSet<(NodeId, String)>,
}

impl Resolver {
    fn new(absolute_symlinks_resolve: bool, force_create: bool) -> Self {
        Self {
            absolute_symlinks_resolve,
            force_create,
            seen: HashSet::new(),
        }
    }

    /// Resolve `name` in `dir` to a directory, a file, or nothing (broken
    /// chain). With `force_create`, missing directories along symlink
    /// targets are created and blocking files replaced with directories.
    fn resolve(&mut self, tree: &mut CasTree, dir: NodeId, name: &str) -> Result<Resolved> {
        let entry = tree.nodes[dir].entries.get(name).cloned();
        let target = match entry {
            None => return Ok(Resolved::NotFound),
            Some(IndexEntry::Directory { .. }) => {
                return Ok(Resolved::Directory(tree.ensure_child(dir, name)?))
            }
            Some(IndexEntry::File { .. }) => return Ok(Resolved::File),
            Some(IndexEntry::Symlink { target, .. }) => target,
        };

        if !self.seen.insert((dir, name.to_string())) {
            return Err(CasError::InfiniteSymlink {
                name: name.to_string(),
            });
        }

        let mut components: Vec<&str> = target.split('/').collect();
        let mut current = dir;

        if target.starts_with('/') {
            if self.absolute_symlinks_resolve {
                current = tree.find_root_of(dir);
                components.remove(0); // discard the leading empty component
            } else {
                return Err(CasError::AbsoluteSymlink {
                    name: name.to_string(),
                });
            }
        }

        let mut resolution = Resolved::Directory(current);
        let mut remaining = components.into_iter().collect::<std::collections::VecDeque<_>>();
        while let Resolved::Directory(d) = resolution {
            let Some(component) = remaining.pop_front() else {
                break;
            };
            resolution = self.resolve_component(tree, d, component, !remaining.is_empty())?;
        }

        Ok(resolution)
    }

    fn resolve_component(
        &mut self,
        tree: &mut CasTree,
        dir: NodeId,
        component: &str,
        require_traversable: bool,
    ) -> Result<Resolved> {
        if component.is_empty() || component == "." {
            return Ok(Resolved::Directory(dir));
        }
        if component == ".." {
            // '..' from the root is valid under POSIX; it stays at the root.
            return Ok(Resolved::Directory(
                tree.nodes[dir].parent.unwrap_or(dir),
            ));
        }

        if tree.nodes[dir].entries.contains_key(component) {
            let resolved = self.resolve(tree, dir, component)?;
            if resolved == Resolved::File && require_traversable {
                // Components remain but this one is a regular file.
                if self.force_create {
                    tree.delete_entry(dir, component);
                    return Ok(Resolved::Directory(tree.descend(dir, &[component], true)?));
                }
                return Err(CasError::UnexpectedFile {
                    name: component.to_string(),
                });
            }
            Ok(resolved)
        } else if self.force_create {
            Ok(Resolved::Directory(tree.descend(dir, &[component], true)?))
        } else {
            Ok(Resolved::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> (TempDir, CasTree) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ObjectStore::open(tmp.path()).unwrap());
        (tmp, CasTree::new(store))
    }

    fn add_file(tree: &mut CasTree, node: NodeId, name: &str, data: &[u8]) {
        let digest = tree.store.put_bytes(data).unwrap();
        tree.add_file_entry(node, name, digest, false, false);
    }

    #[test]
    fn descend_creates_and_finds() {
        let (_tmp, mut t) = tree();
        let root = t.root();

        let sub = t.descend(root, &["a", "b"], true).unwrap();
        assert!(t.is_empty(sub));

        let found = t.descend(root, &["a", "b"], false).unwrap();
        assert_eq!(found, sub);

        assert!(matches!(
            t.descend(root, &["a", "missing"], false),
            Err(CasError::MissingPath { .. })
        ));
    }

    #[test]
    fn descend_into_file_fails() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        add_file(&mut t, root, "f", b"data");

        assert!(matches!(
            t.descend(root, &["f"], false),
            Err(CasError::NotADirectory { .. })
        ));
    }

    #[test]
    fn descend_through_symlink_to_directory() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.descend(root, &["real"], true).unwrap();
        t.add_symlink_entry(root, "link", "real".to_string());

        let through_link = t.descend(root, &["link"], false).unwrap();
        let direct = t.descend(root, &["real"], false).unwrap();
        assert_eq!(through_link, direct);
    }

    #[test]
    fn self_symlink_is_infinite() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.add_symlink_entry(root, "a", "a".to_string());

        let mut resolver = Resolver::new(true, false);
        assert!(matches!(
            resolver.resolve(&mut t, root, "a"),
            Err(CasError::InfiniteSymlink { .. })
        ));
    }

    #[test]
    fn mutual_symlink_loop_is_infinite() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.add_symlink_entry(root, "a", "b".to_string());
        t.add_symlink_entry(root, "b", "a".to_string());

        let mut resolver = Resolver::new(true, false);
        assert!(matches!(
            resolver.resolve(&mut t, root, "a"),
            Err(CasError::InfiniteSymlink { .. })
        ));
    }

    #[test]
    fn absolute_symlink_policy() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.descend(root, &["etc"], true).unwrap();
        t.add_symlink_entry(root, "link", "/etc".to_string());

        // Allowed: restarts from the virtual root
        let mut allowing = Resolver::new(true, false);
        assert!(matches!(
            allowing.resolve(&mut t, root, "link").unwrap(),
            Resolved::Directory(_)
        ));

        // Disallowed: surfaces the policy error
        let mut strict = Resolver::new(false, false);
        assert!(matches!(
            strict.resolve(&mut t, root, "link"),
            Err(CasError::AbsoluteSymlink { .. })
        ));
    }

    #[test]
    fn dotdot_at_root_stays_at_root() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.descend(root, &["dir"], true).unwrap();
        t.add_symlink_entry(root, "up", "../../dir".to_string());

        let mut resolver = Resolver::new(true, false);
        let resolved = resolver.resolve(&mut t, root, "up").unwrap();
        let direct = t.descend(root, &["dir"], false).unwrap();
        assert_eq!(resolved, Resolved::Directory(direct));
    }

    #[test]
    fn file_mid_target_is_unexpected() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        add_file(&mut t, root, "blocker", b"file");
        t.add_symlink_entry(root, "link", "blocker/below".to_string());

        let mut resolver = Resolver::new(true, false);
        assert!(matches!(
            resolver.resolve(&mut t, root, "link"),
            Err(CasError::UnexpectedFile { .. })
        ));

        // With force_create the file gives way to a directory
        let mut forcing = Resolver::new(true, true);
        assert!(matches!(
            forcing.resolve(&mut t, root, "link").unwrap(),
            Resolved::Directory(_)
        ));
        assert!(matches!(
            t.lookup(root, "blocker").unwrap(),
            Some(EntryKind::Directory)
        ));
    }

    #[test]
    fn broken_symlink_resolves_to_nothing() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        t.add_symlink_entry(root, "dangling", "nowhere".to_string());

        let mut resolver = Resolver::new(true, false);
        assert_eq!(
            resolver.resolve(&mut t, root, "dangling").unwrap(),
            Resolved::NotFound
        );
    }

    #[test]
    fn digest_is_invalidated_by_edits() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        let sub = t.descend(root, &["dir"], true).unwrap();

        let before = t.digest(root).unwrap();
        add_file(&mut t, sub, "new", b"contents");
        let after = t.digest(root).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn open_round_trips_digest() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        let sub = t.descend(root, &["bin"], true).unwrap();
        let digest = t.store.put_bytes(b"#!/bin/sh\n").unwrap();
        t.add_file_entry(sub, "hello", digest, true, false);
        t.add_symlink_entry(root, "link", "bin".to_string());

        let root_digest = t.digest(root).unwrap();
        let store = t.store.clone();
        let mut reopened = CasTree::open(store, &root_digest).unwrap();
        let reopened_root = reopened.root();
        assert_eq!(reopened.digest(reopened_root).unwrap(), root_digest);
        assert!(matches!(
            reopened.lookup(reopened_root, "bin/hello").unwrap(),
            Some(EntryKind::File {
                executable: true,
                ..
            })
        ));
    }

    #[test]
    fn listing_yields_empty_dirs_and_sorts() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        add_file(&mut t, root, "b", b"b");
        add_file(&mut t, root, "a", b"a");
        t.descend(root, &["empty"], true).unwrap();
        let sub = t.descend(root, &["sub"], true).unwrap();
        add_file(&mut t, sub, "inner", b"inner");

        let listing = t.list_relative_paths(root).unwrap();
        assert_eq!(listing, vec!["a", "b", "empty", "sub/inner"]);
    }

    #[test]
    fn listing_treats_symlinks_like_their_targets() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        let sub = t.descend(root, &["real"], true).unwrap();
        add_file(&mut t, sub, "f", b"f");
        t.add_symlink_entry(root, "dirlink", "real".to_string());
        t.add_symlink_entry(root, "broken", "gone".to_string());

        let listing = t.list_relative_paths(root).unwrap();
        // symlink-to-dir first, then file-ish entries, then directories
        assert_eq!(listing, vec!["dirlink", "broken", "real/f"]);
    }

    #[test]
    fn modified_tracking() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        add_file(&mut t, root, "old", b"old");
        t.mark_unmodified(root);

        let digest = t.store.put_bytes(b"new").unwrap();
        t.add_file_entry(root, "new", digest, false, true);

        assert_eq!(t.list_modified_paths(root).unwrap(), vec!["new"]);
    }

    #[test]
    fn export_materializes_files_and_links() {
        let (_tmp, mut t) = tree();
        let root = t.root();
        let bin = t.descend(root, &["bin"], true).unwrap();
        let digest = t.store.put_bytes(b"#!/bin/sh\nexit 0\n").unwrap();
        t.add_file_entry(bin, "hello", digest, true, false);
        t.add_symlink_entry(root, "link", "bin/hello".to_string());
        t.descend(root, &["emptydir"], true).unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("export");
        t.export_to(root, &dest).unwrap();

        assert!(dest.join("bin/hello").is_file());
        assert!(dest.join("emptydir").is_dir());
        assert_eq!(
            fs::read_link(dest.join("link")).unwrap().to_string_lossy(),
            "bin/hello"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("bin/hello")).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }
}
