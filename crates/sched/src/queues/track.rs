//! The Track queue: resolve exact source refs

use super::{Disposition, Queue, QueueStatus};
use crate::context::{JobSpec, PipelineContext};
use crate::job::{JobFn, JobOutcome, JobResult, JobStatus};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use tracing::debug;
use weir_graph::Graph;

/// Resolves refs for every source of an element
pub struct TrackQueue;

impl Queue for TrackQueue {
    fn action_name(&self) -> &'static str {
        "Track"
    }

    fn resources(&self) -> &'static [ResourceType] {
        &[ResourceType::Download]
    }

    fn max_retries(&self, ctx: &PipelineContext) -> u32 {
        ctx.core.config.network_retries
    }

    fn status(&self, graph: &Graph, node: NodeIndex, _ctx: &PipelineContext) -> QueueStatus {
        let element = graph.element(node);
        if element.sources.is_empty() || element.sources_resolved() {
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
                let mut refs = Vec::with_capacity(spec.element.sources.len());
                for source in &spec.element.sources {
                    let kind = ctx.sources.get(&source.kind)?;
                    let resolved = match &source.source_ref {
                        Some(existing) => existing.clone(),
                        None => kind.track(source, &ctx.project_root, &ctx.store)?,
                    };
                    refs.push(resolved);
                }
                Ok(JobOutcome::Tracked(refs))
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
        if let Some(JobOutcome::Tracked(refs)) = &result.outcome {
            let element = graph.element_mut(node);
            for (source, resolved) in element.sources.iter_mut().zip(refs) {
                source.source_ref = Some(resolved.clone());
            }
            debug!(element = %element.name, "Tracked sources");
        }
        Disposition::Proceed
    }
}
