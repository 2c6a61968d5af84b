//! Process supervision for one invocation of the extraction executable.
//!
//! [`spawn`] launches the executable with stdout and stderr piped and starts
//! three tasks: a stdout reader that decodes Progress Events, a stderr reader
//! that fills the diagnostic buffer, and a waiter that owns the child, honours
//! termination requests and assembles the [`ProcessReport`].

use crate::error::{DecodeError, JobError};
use crate::event::{decode_line, ProgressEvent};
use crate::types::OrchestratorConfig;
use parking_lot::Mutex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Callback receiving each decoded `Progress` event, in stdout order.
pub type EventCallback = dyn Fn(ProgressEvent) + Send + Sync;

/// How long to wait for the output readers once the process has exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest stdout excerpt included in a malformed-line log entry.
const LOG_LINE_LIMIT: usize = 200;

/// Capability to ask a supervised process to stop.
///
/// Cloning shares the same process. How the request is delivered is an
/// operating-system detail hidden behind [`ProcessHandle::terminate`].
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    pid: Option<u32>,
    terminate_requested: AtomicBool,
    exited: AtomicBool,
    notify: Notify,
}

impl ProcessHandle {
    fn new(pid: Option<u32>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                terminate_requested: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// OS process id, if the child reported one.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Request cooperative termination.
    ///
    /// Returns `true` only for the call that actually issued the request.
    /// Calling this on an exited or already-terminated process is a no-op.
    pub fn terminate(&self) -> bool {
        if self.inner.exited.load(Ordering::SeqCst) {
            return false;
        }
        if self.inner.terminate_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_one();
        true
    }

    /// Whether termination has been requested.
    pub fn termination_requested(&self) -> bool {
        self.inner.terminate_requested.load(Ordering::SeqCst)
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }
}

/// Everything observed about one finished invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub exit_code: Option<i32>,
    /// Whether the OS reported success
    pub success: bool,
    /// Most recent `Complete` event seen on stdout
    pub complete: Option<ProgressEvent>,
    /// How many `Complete` events were seen
    pub complete_count: usize,
    /// Message of the most recent `Error` event
    pub last_error: Option<String>,
    /// Captured standard error (most recent bytes)
    pub stderr: String,
    /// Whether termination was requested before exit
    pub terminate_requested: bool,
    /// Stdout lines that were not Progress Events
    pub malformed_lines: u64,
    /// Why an output reader stopped abnormally; records may have been lost
    pub reader_failure: Option<String>,
}

/// Classification of a finished invocation, ignoring cancellation.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Successful exit with exactly one completion record and no error record
    Completed {
        /// Artifact path from the completion record
        filename: String,
        /// Source title from the completion record
        title: Option<String>,
    },
    /// Any other combination
    Failed {
        /// Diagnostic text for the caller
        diagnostic: String,
    },
}

impl ProcessReport {
    /// Apply the success rule: the exit code and the terminal record must agree.
    pub fn verdict(&self) -> Verdict {
        if self.success
            && self.complete_count == 1
            && self.last_error.is_none()
            && self.reader_failure.is_none()
        {
            if let Some(ProgressEvent::Complete { filename, title }) = &self.complete {
                return Verdict::Completed {
                    filename: filename.clone(),
                    title: title.clone(),
                };
            }
        }

        Verdict::Failed {
            diagnostic: self.diagnostic(),
        }
    }

    fn diagnostic(&self) -> String {
        if let Some(message) = &self.last_error {
            return message.clone();
        }

        let stderr = self.stderr.trim();
        if let Some(failure) = &self.reader_failure {
            return if stderr.is_empty() {
                failure.clone()
            } else {
                format!("{}\n{}", failure, stderr)
            };
        }
        if !stderr.is_empty() {
            return stderr.to_string();
        }

        match (self.exit_code, self.complete_count) {
            (_, n) if n > 1 => format!("executable reported {} completions", n),
            (Some(0), 0) => "executable exited without a completion record".to_string(),
            (Some(code), 0) => format!("executable exited with code {}", code),
            (Some(code), _) => format!(
                "executable exited with code {} after reporting completion",
                code
            ),
            (None, _) => "executable was terminated by a signal".to_string(),
        }
    }
}

/// A running invocation: its termination handle and the task that will
/// produce its report.
pub struct SupervisedProcess {
    handle: ProcessHandle,
    task: JoinHandle<ProcessReport>,
}

impl SupervisedProcess {
    /// Handle for requesting termination.
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Wait for the process to exit and its output to be drained.
    pub async fn wait(self) -> ProcessReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "supervisor task failed");
                ProcessReport {
                    stderr: format!("supervisor task failed: {}", e),
                    terminate_requested: self.handle.termination_requested(),
                    ..ProcessReport::default()
                }
            }
        }
    }
}

#[derive(Default)]
struct OutputCapture {
    complete: Option<ProgressEvent>,
    complete_count: usize,
    last_error: Option<String>,
    stderr: String,
    malformed_lines: u64,
}

/// Launch `program args...` for job `id` and start supervising it.
///
/// Must be called from within a Tokio runtime.
///
/// # Arguments
///
/// * `id` - Job identifier, used for logging
/// * `program` - Executable to launch
/// * `args` - Full argument list
/// * `config` - Working directory, stderr limit and kill grace period
/// * `on_event` - Receives every decoded `Progress` event
///
/// # Errors
///
/// Returns [`JobError::Spawn`] if the executable cannot be launched.
pub fn spawn(
    id: &str,
    program: &Path,
    args: &[String],
    config: &OrchestratorConfig,
    on_event: Arc<EventCallback>,
) -> Result<SupervisedProcess, JobError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        // Null stdin so the child never blocks waiting for input
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        tracing::error!(job_id = %id, program = %program.display(), error = %e, "failed to spawn executable");
        JobError::Spawn(format!("{}: {}", program.display(), e))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| JobError::Spawn("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| JobError::Spawn("failed to capture stderr".to_string()))?;

    let handle = ProcessHandle::new(child.id());
    tracing::info!(job_id = %id, pid = ?handle.pid(), program = %program.display(), "executable started");

    let capture = Arc::new(Mutex::new(OutputCapture::default()));
    let stdout_task = tokio::spawn(read_stdout(
        id.to_string(),
        stdout,
        Arc::clone(&capture),
        on_event,
    ));
    let stderr_task = tokio::spawn(read_stderr(
        id.to_string(),
        stderr,
        Arc::clone(&capture),
        config.stderr_limit_bytes,
    ));

    let task = tokio::spawn(supervise(
        id.to_string(),
        child,
        handle.clone(),
        config.kill_grace,
        capture,
        [stdout_task, stderr_task],
    ));

    Ok(SupervisedProcess { handle, task })
}

async fn supervise(
    id: String,
    mut child: Child,
    handle: ProcessHandle,
    kill_grace: Duration,
    capture: Arc<Mutex<OutputCapture>>,
    readers: [JoinHandle<()>; 2],
) -> ProcessReport {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = handle.inner.notify.notified() => {
            request_stop(&id, &mut child);
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(job_id = %id, grace = ?kill_grace, "executable ignored termination request, killing");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(job_id = %id, error = %e, "forced kill failed");
                    }
                    child.wait().await
                }
            }
        }
    };
    handle.inner.exited.store(true, Ordering::SeqCst);

    let (exit_code, success) = match status {
        Ok(status) => describe_exit(status),
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "failed to wait for executable");
            (None, false)
        }
    };

    let reader_failure = drain_readers(&id, readers).await;

    let capture = std::mem::take(&mut *capture.lock());
    tracing::debug!(job_id = %id, ?exit_code, complete_count = capture.complete_count, "executable exited");

    ProcessReport {
        exit_code,
        success,
        complete: capture.complete,
        complete_count: capture.complete_count,
        last_error: capture.last_error,
        stderr: capture.stderr,
        terminate_requested: handle.termination_requested(),
        malformed_lines: capture.malformed_lines,
        reader_failure,
    }
}

/// Wait for the output readers to finish whatever the child wrote before
/// exiting. Returns a description of every reader that did not end cleanly.
async fn drain_readers(id: &str, readers: [JoinHandle<()>; 2]) -> Option<String> {
    let mut failures = Vec::new();

    for (name, reader) in ["stdout", "stderr"].into_iter().zip(readers) {
        let abort = reader.abort_handle();
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %id, reader = name, error = %e, "output reader failed");
                failures.push(format!("{} reader failed: {}", name, e));
            }
            Err(_) => {
                tracing::warn!(job_id = %id, reader = name, "output pipe still open after exit, abandoning reader");
                abort.abort();
            }
        }
    }

    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}

fn describe_exit(status: ExitStatus) -> (Option<i32>, bool) {
    (status.code(), status.success())
}

/// Deliver the cooperative stop request.
#[cfg(unix)]
fn request_stop(id: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => tracing::info!(job_id = %id, pid, "sent SIGTERM"),
            Err(e) => tracing::warn!(job_id = %id, pid, error = %e, "SIGTERM failed"),
        },
        // Already reaped; nothing to signal
        None => tracing::debug!(job_id = %id, "termination requested after exit"),
    }
}

/// Deliver the stop request. Without POSIX signals this is a forced kill.
#[cfg(not(unix))]
fn request_stop(id: &str, child: &mut Child) {
    match child.start_kill() {
        Ok(()) => tracing::info!(job_id = %id, "killed executable"),
        Err(e) => tracing::warn!(job_id = %id, error = %e, "kill failed"),
    }
}

async fn read_stdout<R>(
    id: String,
    stdout: R,
    capture: Arc<Mutex<OutputCapture>>,
    on_event: Arc<EventCallback>,
) where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stdout).split(b'\n');

    loop {
        let segment = match segments.next_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "stdout read failed");
                break;
            }
        };
        let line = String::from_utf8_lossy(&segment);

        match decode_line(&line) {
            Ok(event @ ProgressEvent::Progress { .. }) => on_event(event),
            Ok(event @ ProgressEvent::Complete { .. }) => {
                let mut capture = capture.lock();
                capture.complete_count += 1;
                capture.complete = Some(event);
            }
            Ok(ProgressEvent::Error { message }) => {
                tracing::debug!(job_id = %id, %message, "executable reported error");
                capture.lock().last_error = Some(message);
            }
            Err(DecodeError::Empty) => {}
            Err(e) => {
                capture.lock().malformed_lines += 1;
                tracing::warn!(
                    job_id = %id,
                    error = %e,
                    line = %truncate(&line, LOG_LINE_LIMIT),
                    "discarding malformed output line"
                );
            }
        }
    }
}

async fn read_stderr<R>(id: String, stderr: R, capture: Arc<Mutex<OutputCapture>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stderr).split(b'\n');

    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                let line = String::from_utf8_lossy(&segment);
                tracing::debug!(job_id = %id, line = %line.trim_end(), "executable stderr");
                append_bounded(&mut capture.lock().stderr, &line, limit);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Append `line` to `buffer`, discarding the oldest text beyond `limit` bytes.
fn append_bounded(buffer: &mut String, line: &str, limit: usize) {
    buffer.push_str(line.trim_end_matches('\r'));
    buffer.push('\n');

    if buffer.len() > limit {
        let mut cut = buffer.len() - limit;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
