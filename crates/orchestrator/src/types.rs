//! Type definitions for job orchestration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use ts_rs::TS;

/// Lifecycle state of a job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../bindings/")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Registered, process not yet launched
    Pending,
    /// Process launched and being supervised
    Running,
    /// Process exited successfully with exactly one completion record
    Completed,
    /// Any other exit
    Failed,
    /// Terminated on request
    Cancelled,
}

impl JobState {
    /// Whether this state is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../bindings/")]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// A caller asked for it
    Requested,
    /// An internal deadline elapsed
    Timeout,
}

/// Artifact produced by a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../bindings/")]
#[serde(rename_all = "camelCase")]
pub struct CompletedArtifact {
    /// Location of the produced file
    #[ts(type = "string")]
    pub path: PathBuf,

    /// Size in bytes at completion time (if the file could be inspected)
    #[ts(optional, type = "number")]
    pub size: Option<u64>,

    /// Title of the source, when reported
    #[ts(optional)]
    pub title: Option<String>,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../bindings/")]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Caller-supplied identifier
    pub id: String,

    /// Current state
    pub state: JobState,

    /// Last reported percentage
    #[ts(optional)]
    pub percentage: Option<f64>,

    /// Present only when `Completed`
    #[ts(optional)]
    pub artifact: Option<CompletedArtifact>,

    /// Diagnostic text, present only when `Failed` (or the cancel reason when `Cancelled`)
    #[ts(optional)]
    pub error: Option<String>,

    /// Process exit code, once known
    #[ts(optional)]
    pub exit_code: Option<i32>,

    /// Wall time from start to now, or to the terminal state (in seconds)
    #[serde(with = "duration_serde")]
    #[ts(type = "number")]
    pub elapsed: Duration,
}

/// Options for launching and supervising extraction jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Executable to launch
    pub program: PathBuf,

    /// Arguments placed before the job identifier
    pub leading_args: Vec<String>,

    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,

    /// Bounded buffer size per progress subscriber
    pub subscriber_buffer: usize,

    /// Maximum captured stderr, keeping the most recent bytes
    pub stderr_limit_bytes: usize,

    /// Time allowed between the termination request and a forced kill
    #[serde(with = "duration_serde")]
    pub kill_grace: Duration,

    /// How many terminal job records to keep for later lookup
    pub finished_retention: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            leading_args: vec!["scripts/download.py".to_string()],
            working_dir: None,
            subscriber_buffer: 32,
            stderr_limit_bytes: 64 * 1024, // 64 KiB
            kill_grace: Duration::from_secs(5),
            finished_retention: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Config that runs `program <id>` with no leading arguments.
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            ..Self::default()
        }
    }

    /// Full argument list for one job.
    pub fn args_for(&self, id: &str) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push(id.to_string());
        args
    }
}

// Helper module for Duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_args_for() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.args_for("abc"), vec!["scripts/download.py", "abc"]);

        let config = OrchestratorConfig::for_program("/usr/local/bin/grab");
        assert_eq!(config.args_for("abc"), vec!["abc"]);
    }

    #[test]
    fn test_config_partial_json() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"program":"/opt/grab","killGrace":1.5}"#).unwrap();
        assert_eq!(config.program, PathBuf::from("/opt/grab"));
        assert_eq!(config.kill_grace, Duration::from_millis(1500));
        assert_eq!(config.subscriber_buffer, 32);
    }

    #[test]
    fn test_snapshot_serialize() {
        let snapshot = JobSnapshot {
            id: "v1".to_string(),
            state: JobState::Running,
            percentage: Some(10.0),
            artifact: None,
            error: None,
            exit_code: None,
            elapsed: Duration::from_secs(2),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"exitCode\":null"));
        assert!(json.contains("\"elapsed\":2.0"));
    }
}
