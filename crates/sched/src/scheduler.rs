//! The dispatch loop
//!
//! A single cooperative loop drives the staged queues: it moves finished
//! elements to the next stage, re-evaluates waiters on every state change,
//! starts ready jobs under all-or-nothing resource reservation, and then
//! awaits the next job completion. Jobs run as spawned tasks and report
//! back over a channel.

use crate::context::{JobSpec, PipelineContext};
use crate::error::{Result, SchedError};
use crate::job::{run_job, JobResult, JobStatus};
use crate::queues::{standard_queues, Disposition, Queue, QueueStatus, STAGE_TRACK};
use crate::resources::{ResourceType, Resources};
use petgraph::graph::NodeIndex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use weir_graph::{compute_keys, plan, ElementState, Graph, Scope};

/// How a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every queue drained without failures
    Success,
    /// At least one element failed
    Failure,
    /// The user cancelled the invocation
    Terminated,
}

impl Outcome {
    /// The process exit code this outcome maps to.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 2,
            Self::Terminated => 3,
        }
    }
}

/// Bookkeeping of one finished run
#[derive(Debug)]
pub struct RunSummary {
    /// How the run ended
    pub outcome: Outcome,
    /// `(action, element)` pairs that were processed by a job
    pub processed: Vec<(String, String)>,
    /// `(action, element)` pairs that skipped a stage
    pub skipped: Vec<(String, String)>,
    /// Elements that failed
    pub failed: Vec<String>,
}

impl RunSummary {
    /// Elements processed by the named stage.
    #[must_use]
    pub fn processed_in(&self, action: &str) -> Vec<&str> {
        self.processed
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, e)| e.as_str())
            .collect()
    }

    /// Elements that skipped the named stage.
    #[must_use]
    pub fn skipped_in(&self, action: &str) -> Vec<&str> {
        self.skipped
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, e)| e.as_str())
            .collect()
    }
}

struct QueueState {
    /// Ready elements, ordered by build-plan position
    ready: BTreeSet<(usize, NodeIndex)>,
    wait: Vec<NodeIndex>,
    done: VecDeque<NodeIndex>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: BTreeSet::new(),
            wait: Vec::new(),
            done: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.wait.is_empty() && self.done.is_empty()
    }
}

struct Completion {
    queue: usize,
    node: NodeIndex,
    result: JobResult,
}

/// Drives a graph of elements through the queue pipeline
pub struct Scheduler {
    ctx: Arc<PipelineContext>,
    queues: Vec<Box<dyn Queue>>,
    states: Vec<QueueState>,
    resources: Resources,
    order: HashMap<NodeIndex, usize>,
    plan_order: Vec<NodeIndex>,
    processed: Vec<(String, String)>,
    skipped: Vec<(String, String)>,
    failed: Vec<NodeIndex>,
    failure: bool,
}

impl Scheduler {
    /// A scheduler with the standard Track→Fetch→Pull→Build→Push pipeline.
    #[must_use]
    pub fn standard(ctx: Arc<PipelineContext>) -> Self {
        Self::with_queues(ctx, standard_queues())
    }

    /// A scheduler over a custom queue pipeline.
    #[must_use]
    pub fn with_queues(ctx: Arc<PipelineContext>, queues: Vec<Box<dyn Queue>>) -> Self {
        let states = queues.iter().map(|_| QueueState::new()).collect();
        let resources = Resources::new(&ctx.core.config);
        Self {
            ctx,
            queues,
            states,
            resources,
            order: HashMap::new(),
            plan_order: Vec::new(),
            processed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            failure: false,
        }
    }

    /// Run the pipeline for the named targets.
    pub async fn run(&mut self, graph: &mut Graph, targets: &[&str]) -> Result<RunSummary> {
        let target_nodes = targets
            .iter()
            .map(|name| graph.node(name))
            .collect::<weir_graph::Result<Vec<_>>>()?;

        self.refresh(graph);
        self.plan_order = plan(graph, &target_nodes, true);
        for (position, node) in self.plan_order.iter().enumerate() {
            self.order.insert(*node, position);
        }
        info!(elements = self.plan_order.len(), "Planned build");

        // Fail early on invalid configuration, before any job runs
        for node in &self.plan_order {
            let element = graph.element(*node);
            self.ctx.kinds.get(&element.kind)?.preflight(element)?;
            for source in &element.sources {
                self.ctx.sources.get(&source.kind)?;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        for node in self.plan_order.clone() {
            self.enqueue(STAGE_TRACK, graph, node);
        }

        let mut running = 0usize;

        loop {
            // Propagate between stages until quiescent
            loop {
                self.refresh(graph);
                let moved_done = self.advance(graph);
                let moved_wait = self.reevaluate(graph);
                if !moved_done && !moved_wait {
                    break;
                }
            }

            self.maybe_check_cache_size();

            running += self.harvest(graph, &tx);

            if running == 0 {
                if self.states.iter().all(QueueState::is_idle) {
                    break;
                }
                self.drain_stuck(graph);
                break;
            }

            let Some(completion) = rx.recv().await else {
                return Err(SchedError::internal("job channel closed unexpectedly"));
            };
            running -= 1;
            self.resources.release(self.queues[completion.queue].resources());
            self.complete(graph, completion);
        }

        let outcome = if self.failure {
            Outcome::Failure
        } else if self.ctx.core.cancellation().is_cancelled() {
            Outcome::Terminated
        } else {
            Outcome::Success
        };

        Ok(RunSummary {
            outcome,
            processed: std::mem::take(&mut self.processed),
            skipped: std::mem::take(&mut self.skipped),
            failed: self
                .failed
                .iter()
                .map(|n| graph.element(*n).name.clone())
                .collect(),
        })
    }

    /// Recompute keys (where possible) and element states, dependencies
    /// first.
    fn refresh(&mut self, graph: &mut Graph) {
        for node in self.plan_order.clone() {
            if graph.element(node).keys.strong.is_none() && graph.element(node).sources_resolved()
            {
                // Not computable until the dependencies have tracked
                let _ = compute_keys(graph, &self.ctx.kinds, node);
            }
            self.refresh_node(graph, node);
        }
    }

    fn refresh_node(&self, graph: &mut Graph, node: NodeIndex) {
        let element = graph.element(node);
        let artifact_cached = element.keys.strong.as_ref().is_some_and(|key| {
            self.ctx
                .cache
                .contains(&self.ctx.artifact_name(graph.project(), element, key))
        });
        let sources_local = element.sources.is_empty()
            || element.source_digest.is_some()
            || element.sources.iter().all(|s| {
                self.ctx
                    .sources
                    .get(&s.kind)
                    .map(|kind| kind.is_cached(s, &self.ctx.project_root, &self.ctx.store))
                    .unwrap_or(false)
            });
        graph.update_state(node, artifact_cached, sources_local);
    }

    /// Place an element into a stage according to its status.
    fn enqueue(&mut self, stage: usize, graph: &Graph, node: NodeIndex) {
        match self.queues[stage].status(graph, node, &self.ctx) {
            QueueStatus::Skip => {
                self.queues[stage].on_skip(graph, node, &self.ctx);
                self.skipped.push((
                    self.queues[stage].action_name().to_string(),
                    graph.element(node).name.clone(),
                ));
                self.states[stage].done.push_back(node);
            }
            QueueStatus::Ready => {
                let position = self.order.get(&node).copied().unwrap_or(usize::MAX);
                self.states[stage].ready.insert((position, node));
            }
            QueueStatus::Wait => self.states[stage].wait.push(node),
        }
    }

    /// Move elements whose stage completed into the next stage.
    fn advance(&mut self, graph: &Graph) -> bool {
        let mut moved = false;
        loop {
            let mut any = false;
            for stage in 0..self.queues.len() {
                while let Some(node) = self.states[stage].done.pop_front() {
                    any = true;
                    if stage + 1 < self.queues.len() {
                        self.enqueue(stage + 1, graph, node);
                    } else {
                        debug!(element = %graph.element(node).name, "Element complete");
                    }
                }
            }
            if !any {
                break;
            }
            moved = true;
        }
        moved
    }

    /// Re-evaluate waiting elements after state changes.
    fn reevaluate(&mut self, graph: &mut Graph) -> bool {
        let mut moved = false;
        for stage in 0..self.queues.len() {
            let waiting = std::mem::take(&mut self.states[stage].wait);
            for node in waiting {
                if graph.element(node).failed() {
                    moved = true;
                    continue;
                }
                if self.dep_failed(graph, node) {
                    graph.element_mut(node).state = ElementState::Failed;
                    self.failed.push(node);
                    self.failure = true;
                    moved = true;
                    continue;
                }
                match self.queues[stage].status(graph, node, &self.ctx) {
                    QueueStatus::Ready => {
                        let position = self.order.get(&node).copied().unwrap_or(usize::MAX);
                        self.states[stage].ready.insert((position, node));
                        moved = true;
                    }
                    QueueStatus::Skip => {
                        self.queues[stage].on_skip(graph, node, &self.ctx);
                        self.skipped.push((
                            self.queues[stage].action_name().to_string(),
                            graph.element(node).name.clone(),
                        ));
                        self.states[stage].done.push_back(node);
                        moved = true;
                    }
                    QueueStatus::Wait => self.states[stage].wait.push(node),
                }
            }
        }
        moved
    }

    fn dep_failed(&self, graph: &Graph, node: NodeIndex) -> bool {
        graph
            .dependencies(node, Scope::All)
            .iter()
            .any(|dep| *dep != node && graph.element(*dep).failed())
    }

    /// Start as many ready jobs as resources allow, deepest-planned first.
    fn harvest(&mut self, graph: &Graph, tx: &mpsc::UnboundedSender<Completion>) -> usize {
        if self.ctx.core.cancellation().is_cancelled() {
            for state in &mut self.states {
                state.ready.clear();
            }
            return 0;
        }

        let mut started = 0;
        for stage in 0..self.queues.len() {
            loop {
                let Some(&(position, node)) = self.states[stage].ready.iter().next() else {
                    break;
                };
                if !self.resources.reserve(self.queues[stage].resources()) {
                    break;
                }
                self.states[stage].ready.remove(&(position, node));
                self.spawn_job(stage, graph, node, tx);
                started += 1;
            }
        }
        started
    }

    fn spawn_job(
        &mut self,
        stage: usize,
        graph: &Graph,
        node: NodeIndex,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let spec = JobSpec::snapshot(graph, node);
        let action = self.queues[stage].action_name();
        let job = self.queues[stage].process(&self.ctx, spec);
        let retries = self.queues[stage].max_retries(&self.ctx);
        let cancel = self.ctx.core.cancellation().child_token();
        let tx = tx.clone();

        debug!(action, element = %graph.element(node).name, "Starting job");
        tokio::spawn(async move {
            let result = run_job(action, job, retries, cancel).await;
            let _ = tx.send(Completion {
                queue: stage,
                node,
                result,
            });
        });
    }

    /// Handle one job completion on the dispatch loop.
    fn complete(&mut self, graph: &mut Graph, completion: Completion) {
        let Completion {
            queue,
            node,
            result,
        } = completion;
        let action = self.queues[queue].action_name().to_string();
        let element_name = graph.element(node).name.clone();

        if result.status == JobStatus::Cancelled {
            debug!(action, element = %element_name, "Job cancelled");
            return;
        }

        let disposition = self.queues[queue].done(graph, node, &result, &self.ctx);
        self.refresh_node(graph, node);

        match disposition {
            Disposition::Proceed => {
                match result.status {
                    JobStatus::Ok => self.processed.push((action, element_name)),
                    _ => self.skipped.push((action, element_name)),
                }
                self.states[queue].done.push_back(node);
            }
            Disposition::Requeue(stage) => {
                debug!(element = %element_name, stage, "Element re-queued");
                self.enqueue(stage, graph, node);
            }
            Disposition::Failed => {
                warn!(action, element = %element_name, "Element failed");
                graph.element_mut(node).state = ElementState::Failed;
                self.failed.push(node);
                self.failure = true;
                if !self.ctx.core.config.keep_going {
                    self.ctx.core.cancel();
                }
            }
        }
    }

    /// Run the real cache-size check when the estimate crossed the quota,
    /// holding the exclusive cache permit. Defers when a commit is in
    /// flight; the loop comes back around on the next completion.
    fn maybe_check_cache_size(&mut self) {
        if !self.ctx.cache.usage().full() {
            return;
        }
        if !self.resources.reserve(&[ResourceType::Cache]) {
            return;
        }
        if let Ok(_cache_lock) = self.ctx.cache_write.try_lock() {
            match self.ctx.cache.enforce_quota() {
                Ok(result) if !result.refs_removed.is_empty() => {
                    info!(
                        evicted = result.refs_removed.len(),
                        bytes_freed = result.bytes_freed,
                        "Evicted artifacts to stay under quota"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Cache size check failed"),
            }
        }
        self.resources.release(&[ResourceType::Cache]);
    }

    /// Called when nothing runs and nothing can start; drop whatever is
    /// left so the loop can terminate.
    fn drain_stuck(&mut self, graph: &mut Graph) {
        let cancelled = self.ctx.core.cancellation().is_cancelled();
        for stage in 0..self.queues.len() {
            let mut stuck: Vec<NodeIndex> = std::mem::take(&mut self.states[stage].wait);
            stuck.extend(self.states[stage].ready.iter().map(|(_, n)| *n));
            self.states[stage].ready.clear();
            for node in stuck {
                if cancelled {
                    debug!(element = %graph.element(node).name, "Dropped on cancellation");
                } else if !graph.element(node).failed() {
                    warn!(element = %graph.element(node).name, "Element stuck, marking failed");
                    graph.element_mut(node).state = ElementState::Failed;
                    self.failed.push(node);
                    self.failure = true;
                }
            }
        }
    }
}
