//! Jobs: one unit of queue work, with retry and cancellation

use crate::error::{Result, SchedError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use weir_cas::Digest;

/// Final status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The job completed successfully
    Ok,
    /// The job was skipped before doing any work
    Skipped,
    /// The job failed after exhausting its retries
    Fail,
    /// The job was cancelled
    Cancelled,
}

/// Typed result value a job hands back to its queue's `done` hook
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Tracked refs, one per source, in source order
    Tracked(Vec<String>),
    /// Root digest of the staged source tree
    Fetched(Option<Digest>),
    /// Whether an artifact was downloaded
    Pulled(bool),
    /// A committed artifact and its estimated size in bytes
    Built {
        /// Approximate bytes added to the local cache
        artifact_size: u64,
    },
    /// Whether any remote was updated
    Pushed(bool),
}

/// What a finished job reports back to the dispatch loop
#[derive(Debug)]
pub struct JobResult {
    /// Final status
    pub status: JobStatus,
    /// The outcome value for `done`, when successful
    pub outcome: Option<JobOutcome>,
    /// The error, when failed
    pub error: Option<SchedError>,
}

/// A factory producing one attempt of the job's work.
///
/// Retries need a fresh future per attempt, so jobs carry a closure
/// rather than a future.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<JobOutcome>> + Send + Sync>;

/// Delay between job-level retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Run a job to completion: retry transient failures up to `max_retries`,
/// abort promptly on cancellation.
pub async fn run_job(
    action: &str,
    job: JobFn,
    max_retries: u32,
    cancel: CancellationToken,
) -> JobResult {
    let mut attempts = 0;

    loop {
        attempts += 1;

        if cancel.is_cancelled() {
            return JobResult {
                status: JobStatus::Cancelled,
                outcome: None,
                error: None,
            };
        }

        let attempt = job();
        tokio::select! {
            () = cancel.cancelled() => {
                return JobResult {
                    status: JobStatus::Cancelled,
                    outcome: None,
                    error: None,
                };
            }
            result = attempt => match result {
                Ok(outcome) => {
                    return JobResult {
                        status: JobStatus::Ok,
                        outcome: Some(outcome),
                        error: None,
                    };
                }
                Err(e) if e.is_transient() && attempts <= max_retries => {
                    warn!(
                        action,
                        attempts,
                        error = %e,
                        "Job failed on a transient error, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return JobResult {
                        status: JobStatus::Fail,
                        outcome: None,
                        error: Some(e),
                    };
                }
            }
        }
    }
}
