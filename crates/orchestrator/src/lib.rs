//! # Orchestrator
//!
//! Download job orchestration around an external extraction executable.
//!
//! Each job runs one invocation of the executable for a caller-supplied
//! identifier. The executable reports progress as JSON lines on stdout;
//! those are decoded into [`ProgressEvent`]s and fanned out to any number of
//! subscribers. When the job completes, its artifact is handed to the caller
//! exactly once and the temporary file is removed.
//!
//! ## Guarantees
//!
//! - At most one non-terminal job per identifier
//! - Terminal states are absorbing; a cancelled job never becomes `Failed`
//! - Every subscriber sees events in the order the executable wrote them,
//!   followed by exactly one terminal event (none for a cancelled job)
//! - Slow subscribers lose old progress events, never the terminal one
//!
//! ## Example
//!
//! ```rust,no_run
//! use orchestrator::{JobRegistry, OrchestratorConfig};
//!
//! # async fn run() -> Result<(), orchestrator::JobError> {
//! let registry = JobRegistry::new(OrchestratorConfig::default());
//! let job = registry.start_job("dQw4w9WgXcQ")?;
//!
//! let mut events = job.subscribe();
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.to_line());
//! }
//!
//! let artifact = registry.fetch_result("dQw4w9WgXcQ").await?;
//! println!("{} ({} bytes)", artifact.display_name, artifact.size);
//! let _bytes = artifact.into_bytes().await?;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod broadcast;
pub mod error;
pub mod event;
pub mod gate;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod types;

// Re-export main types
pub use artifact::{Artifact, ArtifactReader};
pub use broadcast::{Broadcaster, Subscription};
pub use error::{DecodeError, JobError};
pub use event::{decode_line, ProgressEvent};
pub use gate::StartGate;
pub use queue::{BatchEntry, BatchQueue};
pub use registry::{Job, JobHandle, JobRegistry};
pub use supervisor::ProcessHandle;
pub use types::{CancelReason, CompletedArtifact, JobSnapshot, JobState, OrchestratorConfig};

/// Run a single job to completion with a throwaway registry.
///
/// # Arguments
///
/// * `config` - How to launch the executable
/// * `id` - Identifier passed to the executable
///
/// # Returns
///
/// The opened artifact; its file is removed once read or dropped.
///
/// # Errors
///
/// Any [`JobError`] from starting the job, a failed or cancelled run, or a
/// missing artifact.
pub async fn download(config: OrchestratorConfig, id: &str) -> Result<Artifact, JobError> {
    JobRegistry::new(config).run_to_completion(id).await
}
