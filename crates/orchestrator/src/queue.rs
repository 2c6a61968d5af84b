//! Run a list of identifiers through the registry with bounded concurrency.

use crate::error::JobError;
use crate::registry::{JobHandle, JobRegistry};
use crate::types::{JobSnapshot, JobState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Outcome for one identifier of a batch.
#[derive(Debug)]
pub struct BatchEntry {
    /// Job id as submitted
    pub id: String,
    /// Final snapshot of a completed job, or why it did not complete
    pub result: Result<JobSnapshot, JobError>,
}

/// Starts jobs one after another, never more than `concurrency` at once,
/// checking the registry's start gate before every start.
#[derive(Clone)]
pub struct BatchQueue {
    registry: JobRegistry,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl BatchQueue {
    /// Create a queue over `registry`. A `concurrency` of zero is treated as one.
    pub fn new(registry: JobRegistry, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
            timeout: None,
        }
    }

    /// Cancel each job that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run every identifier and return one entry per identifier, in input order.
    pub async fn run(&self, ids: Vec<String>) -> Vec<BatchEntry> {
        self.run_with(ids, |_| {}).await
    }

    /// Like [`BatchQueue::run`], calling `on_start` for every job right after
    /// it starts (for example to subscribe to its progress).
    pub async fn run_with<F>(&self, ids: Vec<String>, on_start: F) -> Vec<BatchEntry>
    where
        F: Fn(&JobHandle),
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut pending = Vec::with_capacity(ids.len());

        for id in ids {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed
                Err(_) => break,
            };

            if self.registry.gate().is_paused() {
                tracing::info!(job_id = %id, "queue paused, waiting before next start");
            }
            self.registry.gate().wait_open().await;

            let started = match self.timeout {
                Some(timeout) => self.registry.start_job_with_timeout(&id, timeout),
                None => self.registry.start_job(&id),
            };

            match started {
                Ok(job) => {
                    on_start(&job);
                    let watcher = tokio::spawn(async move {
                        let snapshot = job.wait().await;
                        drop(permit);
                        snapshot
                    });
                    pending.push((id, Ok(watcher)));
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "batch entry not started");
                    pending.push((id, Err(e)));
                }
            }
        }

        let mut entries = Vec::with_capacity(pending.len());
        for (id, started) in pending {
            let result = match started {
                Ok(watcher) => match watcher.await {
                    Ok(snapshot) => settle(snapshot),
                    Err(e) => Err(JobError::ExecutionFailed(format!("job watcher failed: {}", e))),
                },
                Err(e) => Err(e),
            };
            entries.push(BatchEntry { id, result });
        }
        entries
    }
}

fn settle(snapshot: JobSnapshot) -> Result<JobSnapshot, JobError> {
    match snapshot.state {
        JobState::Completed => Ok(snapshot),
        JobState::Cancelled => Err(JobError::Cancelled(snapshot.id)),
        _ => Err(JobError::ExecutionFailed(snapshot.error.unwrap_or_default())),
    }
}
