//! Shared pipeline context and job descriptors

use std::path::PathBuf;
use std::sync::Arc;
use weir_artifact::{ArtifactCache, ArtifactName};
use weir_cas::ObjectStore;
use weir_core::{CoreContext, Sandbox};
use weir_graph::{Element, Graph, KindRegistry, Scope, SourceRegistry};

/// Everything a queue or job needs, threaded explicitly
pub struct PipelineContext {
    /// The invocation context (config, cache layout, cancellation)
    pub core: Arc<CoreContext>,
    /// Local object store
    pub store: Arc<ObjectStore>,
    /// Artifact cache over the store plus configured remotes
    pub cache: Arc<ArtifactCache>,
    /// Sandbox used for build commands
    pub sandbox: Arc<dyn Sandbox>,
    /// Element kind registry
    pub kinds: Arc<KindRegistry>,
    /// Source kind registry
    pub sources: Arc<SourceRegistry>,
    /// Root directory sources resolve against
    pub project_root: PathBuf,
    /// Serializes artifact-cache mutations: commits take it briefly,
    /// eviction takes it for the whole pass
    pub cache_write: tokio::sync::Mutex<()>,
}

impl PipelineContext {
    /// The artifact name of an element under one of its keys.
    #[must_use]
    pub fn artifact_name(&self, project: &str, element: &Element, key: &str) -> ArtifactName {
        ArtifactName::new(project, &element.normal_name, key)
    }
}

/// The minimal, owned descriptor a job runs from.
///
/// Jobs execute on worker tasks and never touch the graph; they get a
/// snapshot of their element plus the artifact names of the dependencies
/// they stage.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Project name (for artifact refs)
    pub project: String,
    /// Snapshot of the element
    pub element: Element,
    /// BUILD-scope dependency artifacts, dependencies first
    pub dep_artifacts: Vec<ArtifactName>,
}

impl JobSpec {
    /// Snapshot an element (and its staged dependency names) out of the
    /// graph.
    #[must_use]
    pub fn snapshot(graph: &Graph, node: petgraph::graph::NodeIndex) -> Self {
        let element = graph.element(node).clone();
        let dep_artifacts = graph
            .dependencies(node, Scope::Build)
            .into_iter()
            .filter_map(|dep| {
                let dep_element = graph.element(dep);
                dep_element.keys.strong.as_ref().map(|key| {
                    ArtifactName::new(graph.project(), &dep_element.normal_name, key)
                })
            })
            .collect();

        Self {
            project: graph.project().to_string(),
            element,
            dep_artifacts,
        }
    }

    /// This element's artifact name under its strong key, if known.
    #[must_use]
    pub fn strong_name(&self) -> Option<ArtifactName> {
        self.element
            .keys
            .strong
            .as_ref()
            .map(|key| ArtifactName::new(&self.project, &self.element.normal_name, key))
    }
}
