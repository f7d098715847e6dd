//! The scheduler and queue pipeline for weir
//!
//! Elements flow through the standard Track→Fetch→Pull→Build→Push stages.
//! A single dispatch loop owns the element graph; jobs run as spawned
//! tasks against a minimal snapshot and report back over a channel. Job
//! concurrency is governed by counted resource permits with all-or-nothing
//! reservation.

pub mod context;
pub mod error;
pub mod job;
pub mod queues;
pub mod resources;
pub mod scheduler;

pub use context::{JobSpec, PipelineContext};
pub use error::{Result, SchedError};
pub use job::{JobOutcome, JobResult, JobStatus};
pub use queues::{
    standard_queues, BuildQueue, Disposition, FetchQueue, PullQueue, PushQueue, Queue,
    QueueStatus, TrackQueue, STAGE_BUILD, STAGE_FETCH, STAGE_PULL, STAGE_PUSH, STAGE_TRACK,
};
pub use resources::{ResourceType, Resources};
pub use scheduler::{Outcome, RunSummary, Scheduler};

use std::path::PathBuf;
use std::sync::Arc;
use weir_artifact::ArtifactCache;
use weir_cas::ObjectStore;
use weir_core::{CoreContext, HostSandbox};
use weir_graph::{KindRegistry, SourceRegistry};
use weir_remote::{DirRemote, RemoteSpec};

/// Assemble a [`PipelineContext`] from a core context: open the local
/// store, wire up the configured remotes, and register the built-in
/// element and source kinds.
pub fn build_pipeline(core: Arc<CoreContext>, project_root: PathBuf) -> Result<Arc<PipelineContext>> {
    let store = Arc::new(ObjectStore::open(core.cache_dir())?);

    let mut cache = ArtifactCache::new(
        store.clone(),
        &core.config.quota,
        core.cancellation().clone(),
    );
    for remote_config in &core.config.remotes {
        let spec = RemoteSpec::parse(&remote_config.url, remote_config.push)
            .map_err(weir_artifact::ArtifactError::Remote)?;
        let remote = DirRemote::open(&spec).map_err(weir_artifact::ArtifactError::Remote)?;
        cache.add_remote(Arc::new(remote));
    }

    Ok(Arc::new(PipelineContext {
        core,
        store,
        cache: Arc::new(cache),
        sandbox: Arc::new(HostSandbox),
        kinds: Arc::new(KindRegistry::with_builtins()),
        sources: Arc::new(SourceRegistry::with_builtins()),
        project_root,
        cache_write: tokio::sync::Mutex::new(()),
    }))
}
