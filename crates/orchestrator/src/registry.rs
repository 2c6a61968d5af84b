//! Job registry: at most one active job per identifier.
//!
//! Every insert, state transition and removal happens under one mutex, so
//! two concurrent starts for the same identifier are linearized and exactly
//! one of them wins. A job leaves the active map the moment it reaches a
//! terminal state; its record is then retained (bounded) for lookups.

use crate::artifact::{self, Artifact};
use crate::broadcast::{Broadcaster, Subscription};
use crate::error::JobError;
use crate::event::ProgressEvent;
use crate::gate::StartGate;
use crate::supervisor::{self, ProcessHandle, SupervisedProcess, Verdict};
use crate::types::{CancelReason, CompletedArtifact, JobSnapshot, JobState, OrchestratorConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Longest accepted job identifier.
pub const MAX_ID_LEN: usize = 64;

/// Handle returned by [`JobRegistry::start_job`].
pub type JobHandle = Arc<Job>;

/// One tracked extraction attempt.
pub struct Job {
    id: String,
    generation: u64,
    started_at: Instant,
    status: Mutex<JobStatus>,
    process: OnceLock<ProcessHandle>,
    broadcaster: Broadcaster,
    done: watch::Sender<bool>,
}

struct JobStatus {
    state: JobState,
    percentage: Option<f64>,
    artifact: Option<CompletedArtifact>,
    artifact_taken: bool,
    error: Option<String>,
    exit_code: Option<i32>,
    finished_at: Option<Instant>,
}

enum Outcome {
    Completed(CompletedArtifact),
    Failed(String),
    Cancelled(CancelReason),
}

impl Job {
    fn new(id: &str, generation: u64, buffer: usize) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: id.to_string(),
            generation,
            started_at: Instant::now(),
            status: Mutex::new(JobStatus {
                state: JobState::Pending,
                percentage: None,
                artifact: None,
                artifact_taken: false,
                error: None,
                exit_code: None,
                finished_at: None,
            }),
            process: OnceLock::new(),
            broadcaster: Broadcaster::new(id, buffer),
            done,
        }
    }

    /// Caller-supplied identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.status.lock().state
    }

    /// Termination handle of the underlying process, once launched.
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.get()
    }

    /// Point-in-time view of the job.
    pub fn snapshot(&self) -> JobSnapshot {
        let status = self.status.lock();
        let end = status.finished_at.unwrap_or_else(Instant::now);
        JobSnapshot {
            id: self.id.clone(),
            state: status.state,
            percentage: status.percentage,
            artifact: status.artifact.clone(),
            error: status.error.clone(),
            exit_code: status.exit_code,
            elapsed: end.saturating_duration_since(self.started_at),
        }
    }

    /// Follow this job's Progress Events.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Suspend until the job is terminal, then return its final snapshot.
    pub async fn wait(&self) -> JobSnapshot {
        let mut rx = self.done.subscribe();
        // The sender is owned by `self`; the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
        self.snapshot()
    }

    fn mark_running(&self, handle: ProcessHandle) {
        // Set exactly once, right after spawning
        let _ = self.process.set(handle);
        let mut status = self.status.lock();
        if status.state == JobState::Pending {
            status.state = JobState::Running;
        }
    }

    fn record_progress(&self, event: ProgressEvent) {
        if let ProgressEvent::Progress { percentage, .. } = &event {
            let mut status = self.status.lock();
            if status.state.is_terminal() {
                return;
            }
            status.percentage = Some(*percentage);
        }
        self.broadcaster.publish(event);
    }

    /// Move to a terminal state. Returns `false` if already terminal.
    fn settle(&self, outcome: Outcome, exit_code: Option<i32>) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }

        status.finished_at = Some(Instant::now());
        status.exit_code = exit_code;
        match outcome {
            Outcome::Completed(artifact) => {
                status.state = JobState::Completed;
                status.percentage = Some(100.0);
                status.artifact = Some(artifact);
            }
            Outcome::Failed(diagnostic) => {
                status.state = JobState::Failed;
                status.error = Some(diagnostic);
            }
            Outcome::Cancelled(reason) => {
                status.state = JobState::Cancelled;
                status.error = Some(match reason {
                    CancelReason::Requested => "cancelled by request".to_string(),
                    CancelReason::Timeout => "cancelled after timeout".to_string(),
                });
            }
        }
        true
    }

    /// Deliver the terminal event to subscribers and wake waiters.
    fn announce(&self) {
        let (state, terminal) = {
            let status = self.status.lock();
            let terminal = match status.state {
                JobState::Completed => status.artifact.as_ref().map(|a| ProgressEvent::Complete {
                    filename: a.path.display().to_string(),
                    title: a.title.clone(),
                }),
                JobState::Failed => Some(ProgressEvent::Error {
                    message: status.error.clone().unwrap_or_default(),
                }),
                _ => None,
            };
            (status.state, terminal)
        };

        self.broadcaster.finish(terminal, state);
        self.done.send_replace(true);
    }

    /// Hand over this job's artifact. Works once, and only for a completed job.
    pub async fn result(&self) -> Result<Artifact, JobError> {
        let completed = self.take_artifact()?;
        artifact::extract(&completed).await
    }

    /// Claim the artifact of a completed job. Succeeds once.
    fn take_artifact(&self) -> Result<CompletedArtifact, JobError> {
        let mut status = self.status.lock();
        match status.state {
            JobState::Completed => {}
            JobState::Failed => {
                return Err(JobError::ExecutionFailed(
                    status.error.clone().unwrap_or_default(),
                ))
            }
            JobState::Cancelled => return Err(JobError::Cancelled(self.id.clone())),
            JobState::Pending | JobState::Running => {
                return Err(JobError::NotCompleted(self.id.clone()))
            }
        }

        let artifact = status
            .artifact
            .clone()
            .ok_or_else(|| JobError::NotCompleted(self.id.clone()))?;
        if status.artifact_taken {
            return Err(JobError::ArtifactMissing(artifact.path));
        }
        status.artifact_taken = true;
        Ok(artifact)
    }
}

/// Directory of active jobs, shared by cloning.
#[derive(Clone)]
pub struct JobRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    config: OrchestratorConfig,
    gate: StartGate,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    next_generation: u64,
    active: HashMap<String, Arc<Job>>,
    finished: HashMap<String, Arc<Job>>,
    finished_order: VecDeque<String>,
}

impl JobRegistry {
    /// Create a registry that launches jobs according to `config`.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                gate: StartGate::new(),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Launch configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Pause/resume flag shared by everything that starts jobs in batches.
    pub fn gate(&self) -> &StartGate {
        &self.shared.gate
    }

    /// Start a job for `id`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`JobError::InvalidId`] if `id` is not 1-64 characters of `[A-Za-z0-9_-]`
    /// - [`JobError::AlreadyRunning`] if a non-terminal job for `id` exists
    /// - [`JobError::Spawn`] if the executable cannot be launched
    pub fn start_job(&self, id: &str) -> Result<JobHandle, JobError> {
        validate_id(id)?;
        let config = &self.shared.config;
        resolve_program(config)?;

        let mut state = self.shared.state.lock();
        if state.active.contains_key(id) {
            tracing::info!(job_id = %id, "start rejected, job already running");
            return Err(JobError::AlreadyRunning(id.to_string()));
        }

        state.next_generation += 1;
        let job = Arc::new(Job::new(id, state.next_generation, config.subscriber_buffer));
        state.active.insert(id.to_string(), Arc::clone(&job));

        let on_event = {
            let job = Arc::clone(&job);
            Arc::new(move |event: ProgressEvent| job.record_progress(event))
        };

        let process =
            match supervisor::spawn(id, &config.program, &config.args_for(id), config, on_event) {
                Ok(process) => process,
                Err(e) => {
                    self.retire_locked(&mut state, &job, Outcome::Failed(e.to_string()), None);
                    drop(state);
                    job.announce();
                    return Err(e);
                }
            };

        job.mark_running(process.handle().clone());
        drop(state);

        tracing::info!(job_id = %id, "job started");
        tokio::spawn(monitor(self.clone(), Arc::clone(&job), process));

        Ok(job)
    }

    /// Start a job that is cancelled automatically if still running after `timeout`.
    pub fn start_job_with_timeout(&self, id: &str, timeout: Duration) -> Result<JobHandle, JobError> {
        let job = self.start_job(id)?;

        let registry = self.clone();
        let watched = Arc::clone(&job);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if registry.cancel_instance(&watched, CancelReason::Timeout) {
                        tracing::warn!(job_id = %watched.id(), ?timeout, "job timed out");
                    }
                }
                _ = watched.wait() => {}
            }
        });

        Ok(job)
    }

    /// Cancel the active job for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] when no job for `id` is running; callers
    /// should treat that as a benign "not running".
    pub fn cancel_job(&self, id: &str) -> Result<JobSnapshot, JobError> {
        self.cancel_with_reason(id, CancelReason::Requested)
    }

    /// Cancel the active job for `id`, recording why.
    pub fn cancel_with_reason(&self, id: &str, reason: CancelReason) -> Result<JobSnapshot, JobError> {
        let job = {
            let mut state = self.shared.state.lock();
            let job = state
                .active
                .get(id)
                .cloned()
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            self.retire_locked(&mut state, &job, Outcome::Cancelled(reason), None);
            job
        };

        self.finish_cancel(&job, reason);
        Ok(job.snapshot())
    }

    /// Cancel every active job. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let jobs: Vec<Arc<Job>> = {
            let mut state = self.shared.state.lock();
            let jobs: Vec<Arc<Job>> = state.active.values().cloned().collect();
            for job in &jobs {
                self.retire_locked(&mut state, job, Outcome::Cancelled(reason), None);
            }
            jobs
        };

        for job in &jobs {
            self.finish_cancel(job, reason);
        }
        jobs.len()
    }

    /// Cancel `job` only if it is still the active job for its id.
    ///
    /// Unlike [`cancel_job`](Self::cancel_job) this never touches a newer job
    /// that has since started under the same id. Returns whether `job` was
    /// cancelled by this call.
    pub fn cancel_instance(&self, job: &JobHandle, reason: CancelReason) -> bool {
        {
            let mut state = self.shared.state.lock();
            match state.active.get(job.id()) {
                Some(current) if Arc::ptr_eq(current, job) => {}
                _ => return false,
            }
            self.retire_locked(&mut state, job, Outcome::Cancelled(reason), None);
        }

        self.finish_cancel(job, reason);
        true
    }

    fn finish_cancel(&self, job: &Job, reason: CancelReason) {
        if let Some(handle) = job.process() {
            handle.terminate();
        }
        tracing::info!(job_id = %job.id(), ?reason, "job cancelled");
        job.announce();
    }

    /// Snapshot of the job for `id`: the active one, else the last finished one.
    pub fn get_job(&self, id: &str) -> Result<JobSnapshot, JobError> {
        self.lookup(id).map(|job| job.snapshot())
    }

    /// Snapshots of all active jobs.
    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.shared.state.lock();
        let mut jobs: Vec<JobSnapshot> = state.active.values().map(|j| j.snapshot()).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Follow the Progress Events of the job for `id`.
    ///
    /// A job that has already finished yields a subscription that delivers
    /// its terminal event and ends.
    pub fn subscribe(&self, id: &str) -> Result<Subscription, JobError> {
        self.lookup(id).map(|job| job.subscribe())
    }

    /// Suspend until the job for `id` is terminal.
    pub async fn wait(&self, id: &str) -> Result<JobSnapshot, JobError> {
        let job = self.lookup(id)?;
        Ok(job.wait().await)
    }

    /// Hand over the artifact of the completed job for `id`. Works once.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] for unknown identifiers
    /// - [`JobError::NotCompleted`] while the job is still running
    /// - [`JobError::ExecutionFailed`] / [`JobError::Cancelled`] for other terminal states
    /// - [`JobError::ArtifactMissing`] if already fetched or the file is gone
    pub async fn fetch_result(&self, id: &str) -> Result<Artifact, JobError> {
        self.lookup(id)?.result().await
    }

    /// Start `id`, wait for it, and hand over its artifact.
    pub async fn run_to_completion(&self, id: &str) -> Result<Artifact, JobError> {
        let job = self.start_job(id)?;
        let snapshot = job.wait().await;
        tracing::debug!(job_id = %id, state = %snapshot.state, "job settled");
        job.result().await
    }

    fn lookup(&self, id: &str) -> Result<Arc<Job>, JobError> {
        let state = self.shared.state.lock();
        state
            .active
            .get(id)
            .or_else(|| state.finished.get(id))
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Settle `job` and move it from the active map to the finished records.
    fn retire_locked(
        &self,
        state: &mut RegistryState,
        job: &Arc<Job>,
        outcome: Outcome,
        exit_code: Option<i32>,
    ) -> bool {
        if !job.settle(outcome, exit_code) {
            return false;
        }

        if let Some(current) = state.active.get(job.id()) {
            if current.generation == job.generation {
                state.active.remove(job.id());
            }
        }

        state.finished_order.retain(|id| id != job.id());
        state.finished_order.push_back(job.id().to_string());
        state
            .finished
            .insert(job.id().to_string(), Arc::clone(job));

        while state.finished.len() > self.shared.config.finished_retention {
            match state.finished_order.pop_front() {
                Some(oldest) => {
                    state.finished.remove(&oldest);
                }
                None => break,
            }
        }

        true
    }

    fn artifact_path(&self, filename: &str) -> PathBuf {
        let path = PathBuf::from(filename);
        match &self.shared.config.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }
}

async fn monitor(registry: JobRegistry, job: Arc<Job>, process: SupervisedProcess) {
    let report = process.wait().await;

    let outcome = if report.terminate_requested {
        Outcome::Cancelled(CancelReason::Requested)
    } else {
        match report.verdict() {
            Verdict::Completed { filename, title } => {
                let path = registry.artifact_path(&filename);
                let size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
                Outcome::Completed(CompletedArtifact { path, size, title })
            }
            Verdict::Failed { diagnostic } => Outcome::Failed(diagnostic),
        }
    };

    let orphan = match &outcome {
        Outcome::Completed(artifact) => Some(artifact.path.clone()),
        _ => None,
    };

    let settled = {
        let mut state = registry.shared.state.lock();
        registry.retire_locked(&mut state, &job, outcome, report.exit_code)
    };

    if settled {
        let snapshot = job.snapshot();
        match snapshot.state {
            JobState::Failed => tracing::warn!(
                job_id = %job.id(),
                exit_code = ?report.exit_code,
                error = %snapshot.error.as_deref().unwrap_or_default(),
                "job failed"
            ),
            state => tracing::info!(job_id = %job.id(), %state, exit_code = ?report.exit_code, "job finished"),
        }
        job.announce();
        return;
    }

    // Cancelled while the process was finishing
    job.status.lock().exit_code = report.exit_code;
    if let Some(path) = orphan {
        discard_orphan(&path).await;
    }
}

async fn discard_orphan(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed artifact of cancelled job"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact of cancelled job")
        }
    }
}

/// Check that `id` is safe to pass to the executable and to use as a key.
pub fn validate_id(id: &str) -> Result<(), JobError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidId(id.to_string()))
    }
}

/// Locate the configured executable and any script it is told to run.
///
/// A program given as a bare name is searched for on `PATH`; anything with a
/// directory component must exist (relative to the working directory when
/// one is configured). Leading arguments that look like script files must
/// exist as well.
///
/// # Errors
///
/// Returns [`JobError::Spawn`] describing the first missing file.
pub fn resolve_program(config: &OrchestratorConfig) -> Result<PathBuf, JobError> {
    let base = config.working_dir.as_deref();
    let anchor = |p: &Path| match base {
        Some(dir) if p.is_relative() => dir.join(p),
        _ => p.to_path_buf(),
    };

    let program = &config.program;
    let resolved = if program.components().count() > 1 || program.is_absolute() {
        let candidate = anchor(program);
        candidate.is_file().then_some(candidate)
    } else {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
    };

    let resolved = resolved.ok_or_else(|| {
        JobError::Spawn(format!("executable not found: {}", program.display()))
    })?;

    for arg in &config.leading_args {
        let path = Path::new(arg);
        if looks_like_script(path) && !anchor(path).is_file() {
            return Err(JobError::Spawn(format!("script not found: {}", arg)));
        }
    }

    Ok(resolved)
}

fn looks_like_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("py" | "sh" | "js" | "rb" | "pl")
    )
}
