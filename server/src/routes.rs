//! HTTP routes for job control and progress streaming.
//!
//! - POST   /api/jobs/{id}          start a job (202 + snapshot)
//! - GET    /api/jobs               list active jobs
//! - GET    /api/jobs/{id}          job snapshot
//! - DELETE /api/jobs/{id}          cancel (`{"cancelled": false}` when not running)
//! - GET    /api/jobs/{id}/progress SSE stream of Progress Events
//! - GET    /api/jobs/{id}/result   the artifact, once
//! - GET    /api/download           start, wait and stream the artifact in one request
//! - GET    /api/health             executable and queue diagnostics
//! - POST   /api/queue[/pause|/resume]

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator::registry::resolve_program;
use orchestrator::{
    Artifact, BatchQueue, CancelReason, JobError, JobHandle, JobRegistry, JobSnapshot,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use ts_rs::TS;

/// Response of the cancel endpoint
#[derive(Debug, Serialize, TS)]
#[ts(export, export_to = "../../bindings/")]
#[cfg_attr(test, derive(Deserialize))]
pub struct CancelResponse {
    /// `false` means the job was not running
    pub cancelled: bool,
}

/// Closing SSE event of a progress stream
#[derive(Debug, Serialize, TS)]
#[ts(export, export_to = "../../bindings/")]
pub struct StreamEnd {
    #[ts(optional)]
    pub state: Option<orchestrator::JobState>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "videoId")]
    pub video_id: Option<String>,
}

/// Body of `POST /api/queue`
#[derive(Debug, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/")]
pub struct QueueRequest {
    pub ids: Vec<String>,
}

/// Queue state returned by the queue endpoints
#[derive(Debug, Serialize, TS)]
#[ts(export, export_to = "../../bindings/")]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Deserialize))]
pub struct QueueStatus {
    pub paused: bool,
    #[ts(optional, type = "number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<usize>,
}

/// Response for the health check endpoint.
#[derive(Debug, Serialize, TS)]
#[ts(export, export_to = "../../bindings/")]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[ts(type = "number")]
    pub uptime_secs: u64,
    /// Where the extraction executable was found, if it was
    #[ts(optional)]
    pub executable: Option<String>,
    /// Why the executable cannot be used, if it cannot
    #[ts(optional)]
    pub executable_error: Option<String>,
    #[ts(type = "number")]
    pub active_jobs: usize,
    pub queue_paused: bool,
}

/// Build the API router.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route(
            "/api/jobs/{id}",
            post(start_job).get(get_job).delete(cancel_job),
        )
        .route("/api/jobs/{id}/progress", get(stream_progress))
        .route("/api/jobs/{id}/result", get(fetch_result))
        .route("/api/download", get(download))
        .route("/api/queue", post(enqueue))
        .route("/api/queue/pause", post(pause_queue))
        .route("/api/queue/resume", post(resume_queue))
        .with_state(state)
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (executable, executable_error) = match resolve_program(state.registry.config()) {
        Ok(path) => (Some(path.display().to_string()), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Json(HealthResponse {
        status: if executable.is_some() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        executable,
        executable_error,
        active_jobs: state.registry.active_jobs().len(),
        queue_paused: state.registry.gate().is_paused(),
    })
}

/// GET /api/jobs
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobSnapshot>> {
    Json(state.registry.active_jobs())
}

/// POST /api/jobs/{id}
async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobSnapshot>), ApiError> {
    let job = launch(&state, &id)?;
    Ok((StatusCode::ACCEPTED, Json(job.snapshot())))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(state.registry.get_job(&id)?))
}

/// DELETE /api/jobs/{id}
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.registry.cancel_job(&id).is_ok(),
    })
}

/// GET /api/jobs/{id}/progress
///
/// Each `data:` line is one Progress Event. The stream closes with an `end`
/// event carrying the final state.
async fn stream_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut sub = state.registry.subscribe(&id)?;

    let stream = async_stream::stream! {
        while let Some(event) = sub.recv().await {
            yield Ok(Event::default().data(event.to_line()));
        }

        if sub.dropped() > 0 {
            tracing::debug!(job_id = %sub.job_id(), dropped = sub.dropped(), "slow progress subscriber");
        }
        let end = StreamEnd { state: sub.closed_state() };
        let json = serde_json::to_string(&end).unwrap_or_default();
        yield Ok(Event::default().event("end").data(json));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/jobs/{id}/result
async fn fetch_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state.registry.fetch_result(&id).await?;
    Ok(artifact_response(artifact))
}

/// GET /api/download?videoId=ID
async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let id = query
        .video_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("videoId is required".to_string()))?;

    let job = launch(&state, &id)?;
    let guard = CancelOnDrop {
        registry: state.registry.clone(),
        job: Arc::clone(&job),
    };
    job.wait().await;
    drop(guard);

    match job.result().await {
        Ok(artifact) => Ok(artifact_response(artifact)),
        Err(JobError::ExecutionFailed(details)) => Err(ApiError::DownloadFailed(details)),
        Err(JobError::Cancelled(_)) => Err(ApiError::DownloadFailed(
            "download was cancelled".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// POST /api/queue
async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueueRequest>,
) -> Result<(StatusCode, Json<QueueStatus>), ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".to_string()));
    }

    let queued = request.ids.len();
    let mut queue = BatchQueue::new(state.registry.clone(), state.settings.queue_concurrency);
    if let Some(secs) = state.settings.job_timeout_secs {
        queue = queue.with_timeout(Duration::from_secs(secs));
    }

    tokio::spawn(async move {
        let entries = queue.run(request.ids).await;
        let failed = entries.iter().filter(|e| e.result.is_err()).count();
        tracing::info!(total = entries.len(), failed, "queued batch finished");
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(QueueStatus {
            paused: state.registry.gate().is_paused(),
            queued: Some(queued),
        }),
    ))
}

/// POST /api/queue/pause
async fn pause_queue(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    state.registry.gate().pause();
    Json(QueueStatus {
        paused: true,
        queued: None,
    })
}

/// POST /api/queue/resume
async fn resume_queue(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    state.registry.gate().resume();
    Json(QueueStatus {
        paused: false,
        queued: None,
    })
}

fn launch(state: &AppState, id: &str) -> Result<JobHandle, JobError> {
    match state.settings.job_timeout_secs {
        Some(secs) => state
            .registry
            .start_job_with_timeout(id, Duration::from_secs(secs)),
        None => state.registry.start_job(id),
    }
}

fn artifact_response(artifact: Artifact) -> Response {
    let headers = [
        (header::CONTENT_TYPE, artifact.content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.display_name),
        ),
        (header::CONTENT_LENGTH, artifact.size.to_string()),
    ];
    let body = Body::from_stream(ReaderStream::new(artifact.into_reader()));

    (headers, body).into_response()
}

/// Cancels the job if the one-shot request goes away before it finishes.
struct CancelOnDrop {
    registry: JobRegistry,
    job: JobHandle,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self
            .registry
            .cancel_instance(&self.job, CancelReason::Requested)
        {
            tracing::info!(job_id = %self.job.id(), "client went away, download cancelled");
        }
    }
}
