use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orchestrator::JobError;
use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;

/// JSON body of every error response
#[derive(Debug, Serialize, TS)]
#[ts(export, export_to = "../../bindings/")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Errors returned by route handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Job(#[from] JobError),

    /// The one-shot download did not produce an artifact
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Job(err) => {
                let (status, error) = match err {
                    JobError::InvalidId(_) => (StatusCode::BAD_REQUEST, "Invalid job id"),
                    JobError::AlreadyRunning(_) => (StatusCode::CONFLICT, "Job already running"),
                    JobError::NotCompleted(_) => (StatusCode::CONFLICT, "Job not completed"),
                    JobError::NotFound(_) => (StatusCode::NOT_FOUND, "Job not found"),
                    JobError::ArtifactMissing(_) => (StatusCode::NOT_FOUND, "Result not available"),
                    JobError::Cancelled(_) => (StatusCode::CONFLICT, "Job cancelled"),
                    JobError::ExecutionFailed(_) => (StatusCode::BAD_GATEWAY, "Download failed"),
                    JobError::Spawn(_) | JobError::Io(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
                    }
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                } else {
                    tracing::debug!(error = %err, "request rejected");
                }
                (status, ErrorResponse::with_details(error, err.to_string()))
            }
            ApiError::DownloadFailed(details) => {
                tracing::warn!(details = %details, "one-shot download failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("Download failed", details.clone()),
                )
            }
            ApiError::BadRequest(details) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_details("Bad request", details.clone()),
            ),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(err: ApiError) -> (StatusCode, ErrorResponse) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_job_error_status_codes() {
        let cases = [
            (JobError::InvalidId("a b".into()), StatusCode::BAD_REQUEST),
            (JobError::AlreadyRunning("v1".into()), StatusCode::CONFLICT),
            (JobError::NotCompleted("v1".into()), StatusCode::CONFLICT),
            (JobError::NotFound("v1".into()), StatusCode::NOT_FOUND),
            (
                JobError::ArtifactMissing("/tmp/x.mp3".into()),
                StatusCode::NOT_FOUND,
            ),
            (JobError::Spawn("python3".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (JobError::ExecutionFailed("boom".into()), StatusCode::BAD_GATEWAY),
        ];

        for (err, expected) in cases {
            let (status, _) = render(ApiError::Job(err)).await;
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_download_failed_body() {
        let (status, body) = render(ApiError::DownloadFailed("Video unavailable".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Download failed");
        assert_eq!(body.details.as_deref(), Some("Video unavailable"));
    }
}
