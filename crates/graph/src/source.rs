//! Source declarations and source kinds
//!
//! A source kind knows how to resolve an exact ref (track), check local
//! availability, and stage content into a CAS tree (fetch). The in-tree
//! `local` kind covers directories inside the project; network source
//! kinds plug in through the same registry.

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use weir_cas::{CasTree, ImportSource, NodeId, ObjectStore};

/// One source entry of an element declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDecl {
    /// Source plugin kind
    pub kind: String,

    /// Path relative to the project root (used by the `local` kind)
    #[serde(default)]
    pub path: Option<String>,

    /// Resolved ref; tracked kinds fill this in
    #[serde(default, rename = "ref")]
    pub source_ref: Option<String>,
}

/// Behavior of one source kind
pub trait SourceKind: Send + Sync {
    /// The registry key for this kind
    fn name(&self) -> &'static str;

    /// Resolve the exact ref for a source.
    fn track(
        &self,
        source: &SourceDecl,
        project_root: &Path,
        store: &Arc<ObjectStore>,
    ) -> Result<String>;

    /// Whether the source content is locally available for staging.
    fn is_cached(&self, source: &SourceDecl, project_root: &Path, store: &ObjectStore) -> bool;

    /// Stage the source content into `node` of `tree`.
    fn stage(
        &self,
        source: &SourceDecl,
        project_root: &Path,
        tree: &mut CasTree,
        node: NodeId,
    ) -> Result<()>;
}

/// A directory inside the project
///
/// Tracking imports the directory into the object store and uses the
/// resulting tree digest as the ref, so any content change changes the
/// element's cache key.
pub struct LocalSource;

impl LocalSource {
    fn source_path<'a>(&self, source: &'a SourceDecl) -> Result<&'a str> {
        source
            .path
            .as_deref()
            .ok_or_else(|| GraphError::load("local source requires a 'path'"))
    }
}

impl SourceKind for LocalSource {
    fn name(&self) -> &'static str {
        "local"
    }

    fn track(
        &self,
        source: &SourceDecl,
        project_root: &Path,
        store: &Arc<ObjectStore>,
    ) -> Result<String> {
        let rel = self.source_path(source)?;
        let dir = project_root.join(rel);
        if !dir.is_dir() {
            return Err(GraphError::load(format!(
                "local source path '{rel}' is not a directory"
            )));
        }

        let mut tree = CasTree::new(store.clone());
        let root = tree.root();
        tree.import(root, ImportSource::Fs(&dir), None)?;
        Ok(tree.digest(root)?.to_string())
    }

    fn is_cached(&self, source: &SourceDecl, _project_root: &Path, store: &ObjectStore) -> bool {
        match &source.source_ref {
            Some(source_ref) => weir_cas::Digest::parse(source_ref)
                .map(|d| store.contains(&d))
                .unwrap_or(false),
            None => false,
        }
    }

    fn stage(
        &self,
        source: &SourceDecl,
        project_root: &Path,
        tree: &mut CasTree,
        node: NodeId,
    ) -> Result<()> {
        // Prefer the tracked tree so staging matches the ref exactly even
        // if the project directory has changed since tracking.
        if let Some(source_ref) = &source.source_ref {
            if let Ok(digest) = weir_cas::Digest::parse(source_ref) {
                if tree.store().contains(&digest) {
                    let store = tree.store().clone();
                    let mut source_tree = CasTree::open(store, &digest)?;
                    let source_root = source_tree.root();
                    tree.import(node, ImportSource::Cas(&mut source_tree, source_root), None)?;
                    return Ok(());
                }
            }
        }

        let rel = self.source_path(source)?;
        tree.import(node, ImportSource::Fs(&project_root.join(rel)), None)?;
        Ok(())
    }
}

/// String-keyed registry of source kinds
pub struct SourceRegistry {
    kinds: HashMap<&'static str, Arc<dyn SourceKind>>,
}

impl SourceRegistry {
    /// Registry with the built-in kinds.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(Arc::new(LocalSource));
        registry
    }

    /// Register an additional source kind.
    pub fn register(&mut self, kind: Arc<dyn SourceKind>) {
        self.kinds.insert(kind.name(), kind);
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn SourceKind>> {
        self.kinds
            .get(name)
            .ok_or_else(|| GraphError::load(format!("unknown source kind '{name}'")))
    }
}
