//! The Push queue: publish built artifacts to push-enabled remotes

use super::{Disposition, Queue, QueueStatus};
use crate::context::{JobSpec, PipelineContext};
use crate::error::SchedError;
use crate::job::{JobFn, JobOutcome, JobResult, JobStatus};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use tracing::{debug, warn};
use weir_graph::Graph;

/// Uploads cached artifacts after a successful build or pull
pub struct PushQueue;

impl Queue for PushQueue {
    fn action_name(&self) -> &'static str {
        "Push"
    }

    fn resources(&self) -> &'static [ResourceType] {
        &[ResourceType::Upload]
    }

    fn max_retries(&self, ctx: &PipelineContext) -> u32 {
        ctx.core.config.network_retries
    }

    fn status(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) -> QueueStatus {
        if !ctx.cache.has_push_remotes() {
            return QueueStatus::Skip;
        }

        let element = graph.element(node);
        let Some(strong) = &element.keys.strong else {
            return QueueStatus::Skip;
        };
        let name = ctx.artifact_name(graph.project(), element, strong);
        if ctx.cache.contains(&name) {
            QueueStatus::Ready
        } else {
            QueueStatus::Skip
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
                    .ok_or_else(|| SchedError::internal("push scheduled without a strong key"))?;
                let artifact = ctx.cache.lookup(&name)?;
                let pushed = ctx.cache.push(&name, &artifact).await?;
                Ok(JobOutcome::Pushed(pushed))
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
        match result.status {
            JobStatus::Ok => {
                debug!(element = %element.name, "Push complete");
            }
            _ => {
                // Pushing is never fatal to the build
                warn!(element = %element.name, "Failed to push artifact, continuing");
            }
        }
        Disposition::Proceed
    }
}
