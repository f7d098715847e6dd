//! The Fetch queue: stage source content into the local CAS

use super::{Disposition, Queue, QueueStatus};
use crate::context::{JobSpec, PipelineContext};
use crate::job::{JobFn, JobOutcome, JobResult, JobStatus};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use tracing::debug;
use weir_cas::CasTree;
use weir_graph::Graph;

/// Makes every source of an element locally available as a staged tree
pub struct FetchQueue;

impl Queue for FetchQueue {
    fn action_name(&self) -> &'static str {
        "Fetch"
    }

    fn resources(&self) -> &'static [ResourceType] {
        &[ResourceType::Download]
    }

    fn max_retries(&self, ctx: &PipelineContext) -> u32 {
        ctx.core.config.network_retries
    }

    fn status(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) -> QueueStatus {
        let element = graph.element(node);

        // Elements with no sources have nothing to fetch
        if element.sources.is_empty() {
            return QueueStatus::Skip;
        }
        if !element.sources_resolved() {
            return QueueStatus::Wait;
        }

        // Skip fetching when the artifact is already cached locally
        if let Some(strong) = &element.keys.strong {
            let name = ctx.artifact_name(graph.project(), element, strong);
            if ctx.cache.contains(&name) {
                return QueueStatus::Skip;
            }
        }

        QueueStatus::Ready
    }

    fn process(&self, ctx: &Arc<PipelineContext>, spec: JobSpec) -> JobFn {
        let ctx = ctx.clone();
        Arc::new(move || {
            let ctx = ctx.clone();
            let spec = spec.clone();
            Box::pin(async move {
                let mut tree = CasTree::new(ctx.store.clone());
                let root = tree.root();
                for source in &spec.element.sources {
                    let kind = ctx.sources.get(&source.kind)?;
                    kind.stage(source, &ctx.project_root, &mut tree, root)?;
                }
                let digest = tree.digest(root)?;
                Ok(JobOutcome::Fetched(Some(digest)))
            })
        })
    }

    fn done(
        &mut self,
        graph: &mut Graph,
        node: NodeIndex,
        result: &JobResult,
        _ctx: &PipelineContext,
    ) -> Disposition {
        if result.status != JobStatus::Ok {
            return Disposition::Failed;
        }
        if let Some(JobOutcome::Fetched(digest)) = &result.outcome {
            let element = graph.element_mut(node);
            element.source_digest = digest.clone();
            debug!(element = %element.name, "Fetched sources");
        }
        Disposition::Proceed
    }
}
