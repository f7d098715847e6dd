//! The staged queue pipeline
//!
//! Each queue is one processing stage (Track, Fetch, Pull, Build, Push)
//! with three element sets managed by the scheduler: ready, waiting and
//! done. A queue declares the resources its jobs hold, reports element
//! eligibility, produces the job work as a [`JobFn`], and post-processes
//! results in `done`, which may redirect an element to another stage.

mod build;
mod fetch;
mod pull;
mod push;
mod track;

pub use build::BuildQueue;
pub use fetch::FetchQueue;
pub use pull::PullQueue;
pub use push::PushQueue;
pub use track::TrackQueue;

use crate::context::{JobSpec, PipelineContext};
use crate::job::{JobFn, JobResult};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use weir_graph::Graph;

/// Queue eligibility of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Not yet eligible; re-evaluated on state changes
    Wait,
    /// Ready for processing
    Ready,
    /// Nothing to do in this stage; pass straight through
    Skip,
}

/// What `done` decided should happen to the element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Advance to the next stage
    Proceed,
    /// Re-enter the pipeline at the given stage
    Requeue(usize),
    /// The element failed
    Failed,
}

/// One pipeline stage
pub trait Queue: Send {
    /// Display name of this stage's action
    fn action_name(&self) -> &'static str;

    /// Resources a job of this stage holds while running
    fn resources(&self) -> &'static [ResourceType];

    /// Job-level retry budget for transient failures
    fn max_retries(&self, _ctx: &PipelineContext) -> u32 {
        0
    }

    /// Eligibility of an element, consulted at enqueue time and whenever
    /// element state changes
    fn status(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) -> QueueStatus;

    /// Produce the work for one element as a re-invokable job factory
    fn process(&self, ctx: &Arc<PipelineContext>, spec: JobSpec) -> JobFn;

    /// Post-process a completed job on the dispatch loop, with access to
    /// the graph
    fn done(
        &mut self,
        graph: &mut Graph,
        node: NodeIndex,
        result: &JobResult,
        ctx: &PipelineContext,
    ) -> Disposition;

    /// Hook invoked when an element skips this stage entirely
    fn on_skip(&self, _graph: &Graph, _node: NodeIndex, _ctx: &PipelineContext) {}
}

/// Index of the Track stage in the standard pipeline
pub const STAGE_TRACK: usize = 0;
/// Index of the Fetch stage in the standard pipeline
pub const STAGE_FETCH: usize = 1;
/// Index of the Pull stage in the standard pipeline
pub const STAGE_PULL: usize = 2;
/// Index of the Build stage in the standard pipeline
pub const STAGE_BUILD: usize = 3;
/// Index of the Push stage in the standard pipeline
pub const STAGE_PUSH: usize = 4;

/// The standard pipeline, in order.
#[must_use]
pub fn standard_queues() -> Vec<Box<dyn Queue>> {
    vec![
        Box::new(TrackQueue),
        Box::new(FetchQueue),
        Box::new(PullQueue),
        Box::new(BuildQueue),
        Box::new(PushQueue),
    ]
}
