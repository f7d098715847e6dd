//! The Pull queue: try remote artifact caches before building

use super::{Disposition, Queue, QueueStatus, STAGE_FETCH};
use crate::context::{JobSpec, PipelineContext};
use crate::error::SchedError;
use crate::job::{JobFn, JobOutcome, JobResult, JobStatus};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use tracing::{debug, warn};
use weir_graph::Graph;

/// Attempts to download an element's artifact instead of building it
pub struct PullQueue;

impl Queue for PullQueue {
    fn action_name(&self) -> &'static str {
        "Pull"
    }

    fn resources(&self) -> &'static [ResourceType] {
        &[ResourceType::Download]
    }

    fn max_retries(&self, ctx: &PipelineContext) -> u32 {
        ctx.core.config.network_retries
    }

    fn status(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) -> QueueStatus {
        if !ctx.cache.has_remotes() {
            return QueueStatus::Skip;
        }

        let element = graph.element(node);
        // The cache cannot be queried until the strong key is available
        let Some(strong) = &element.keys.strong else {
            return QueueStatus::Wait;
        };

        let name = ctx.artifact_name(graph.project(), element, strong);
        if ctx.cache.contains(&name) {
            QueueStatus::Skip
        } else {
            QueueStatus::Ready
        }
    }

    fn process(&self, ctx: &Arc<PipelineContext>, spec: JobSpec) -> JobFn {
        let ctx = ctx.clone();
        Arc::new(move || {
            let ctx = ctx.clone();
            let spec = spec.clone();
            Box::pin(async move {
                let name = spec
                    .strong_name()
                    .ok_or_else(|| SchedError::internal("pull scheduled without a strong key"))?;
                let pulled = ctx
                    .cache
                    .pull(&name, ctx.core.config.pull_buildtrees)
                    .await?;
                Ok(JobOutcome::Pulled(pulled))
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
        let element = graph.element(node);

        match (&result.status, &result.outcome) {
            (JobStatus::Ok, Some(JobOutcome::Pulled(true))) => {
                debug!(element = %element.name, "Artifact pulled");
                Disposition::Proceed
            }
            (JobStatus::Ok, _) => {
                // A miss falls through to the build; if fetching was
                // skipped in anticipation of the pull, go back for the
                // sources first.
                if !element.sources.is_empty() && element.source_digest.is_none() {
                    debug!(element = %element.name, "Pull missed, re-queueing for fetch");
                    Disposition::Requeue(STAGE_FETCH)
                } else {
                    Disposition::Proceed
                }
            }
            _ => {
                // Failing to pull is never fatal; the element still builds.
                warn!(element = %element.name, "Pull failed, falling back to build");
                if !element.sources.is_empty() && element.source_digest.is_none() {
                    Disposition::Requeue(STAGE_FETCH)
                } else {
                    Disposition::Proceed
                }
            }
        }
    }
}
