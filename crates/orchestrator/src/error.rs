//! Error types for job orchestration.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for job operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// The identifier is empty, too long, or contains disallowed characters.
    #[error("Invalid job identifier: {0:?}")]
    InvalidId(String),

    /// A non-terminal job already exists for this identifier.
    #[error("Job already running: {0}")]
    AlreadyRunning(String),

    /// No job is known for this identifier.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The extraction executable could not be launched.
    #[error("Failed to spawn executable: {0}")]
    Spawn(String),

    /// The executable exited unsuccessfully or without a completion record.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The job was cancelled before it finished.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// The job has not completed successfully, so there is no result to fetch.
    #[error("Job has no result: {0}")]
    NotCompleted(String),

    /// The artifact was already consumed or never produced.
    #[error("Artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    /// An I/O error occurred while handling the artifact.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stdout line that is not a Progress Event.
///
/// These are never fatal: the supervisor logs them and moves on.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line is blank.
    #[error("empty line")]
    Empty,

    /// The line is not a JSON object with a known `type`.
    #[error("not a progress record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A known record type with a field that could not be interpreted.
    #[error("invalid {field} value: {value}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Raw value as received
        value: String,
    },
}
