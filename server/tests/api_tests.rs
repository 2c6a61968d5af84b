#![cfg(unix)]

use audiograb_server::{create_app, AppState, ServerSettings};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use orchestrator::OrchestratorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SUCCESS_SCRIPT: &str = r#"
echo '{"type":"progress","percentage":"25%"}'
echo '{"type":"progress","percentage":"75%"}'
printf 'ID3fake' > "My Song: Live!.mp3"
echo '{"type":"complete","success":true,"filename":"My Song: Live!.mp3","title":"My Song"}'
"#;

const FAILING_SCRIPT: &str = r#"
echo '{"type":"error","error":"Video unavailable"}'
exit 1
"#;

const LONG_SCRIPT: &str = r#"
echo '{"type":"progress","percentage":1}'
exec sleep 30
"#;

/// Helper to build the app around a shell script executable
fn app_with_script(dir: &TempDir, body: &str) -> (Router, Arc<AppState>) {
    let script = dir.path().join("fake_download.sh");
    std::fs::write(&script, body).unwrap();

    let settings = ServerSettings {
        orchestrator: OrchestratorConfig {
            program: PathBuf::from("/bin/sh"),
            leading_args: vec![script.display().to_string()],
            working_dir: Some(dir.path().to_path_buf()),
            kill_grace: Duration::from_millis(500),
            ..OrchestratorConfig::default()
        },
        ..ServerSettings::default()
    };

    let state = Arc::new(AppState::new(settings));
    (create_app(Arc::clone(&state)), state)
}

/// Helper to send a request and collect the body
async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = send(app, Method::GET, uri, Body::empty()).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn wait_terminal(state: &AppState, id: &str) {
    tokio::time::timeout(Duration::from_secs(10), state.registry.wait(id))
        .await
        .expect("job did not finish")
        .unwrap();
}

#[tokio::test]
async fn test_health_reports_executable() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _) = app_with_script(&temp_dir, SUCCESS_SCRIPT);

    let (status, json) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["executable"], "/bin/sh");
    assert_eq!(json["activeJobs"], 0);
    assert_eq!(json["queuePaused"], false);
}

#[tokio::test]
async fn test_health_degraded_without_executable() {
    let settings = ServerSettings {
        orchestrator: OrchestratorConfig::for_program("/nonexistent/downloader"),
        ..ServerSettings::default()
    };
    let app = create_app(Arc::new(AppState::new(settings)));

    let (status, json) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
    assert!(json["executableError"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_job_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let (app, state) = app_with_script(&temp_dir, SUCCESS_SCRIPT);

    let (status, body) = send(&app, Method::POST, "/api/jobs/abc123", Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["id"], "abc123");

    wait_terminal(&state, "abc123").await;

    let (status, json) = get_json(&app, "/api/jobs/abc123").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "completed");
    assert_eq!(json["artifact"]["title"], "My Song");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/jobs/abc123/result")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"My Song Live.mp3\""
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"ID3fake");
    assert!(!temp_dir.path().join("My Song: Live!.mp3").exists());

    // The artifact is single-use
    let (status, json) = get_json(&app, "/api/jobs/abc123/result").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Result not available");
}

#[tokio::test]
async fn test_start_conflict_and_cancel() {
    let temp_dir = TempDir::new().unwrap();
    let (app, state) = app_with_script(&temp_dir, LONG_SCRIPT);

    let (status, _) = send(&app, Method::POST, "/api/jobs/v3", Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, Method::POST, "/api/jobs/v3", Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Job already running");

    let (_, json) = get_json(&app, "/api/jobs").await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let (status, json) = get_json(&app, "/api/jobs/v3/result").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "Job not completed");

    let (status, body) = send(&app, Method::DELETE, "/api/jobs/v3", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"cancelled":true}"#);

    // A second cancel is a benign "not running"
    let (_, body) = send(&app, Method::DELETE, "/api/jobs/v3", Body::empty()).await;
    assert_eq!(body, br#"{"cancelled":false}"#);

    wait_terminal(&state, "v3").await;
    let (_, json) = get_json(&app, "/api/jobs/v3").await;
    assert_eq!(json["state"], "cancelled");

    // Free for reuse
    let (status, _) = send(&app, Method::POST, "/api/jobs/v3", Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    state.registry.cancel_job("v3").unwrap();
}

#[tokio::test]
async fn test_invalid_and_unknown_ids() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _) = app_with_script(&temp_dir, SUCCESS_SCRIPT);

    let (status, _) = send(&app, Method::POST, "/api/jobs/bad%20id", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = get_json(&app, "/api/jobs/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Job not found");

    let (status, _) = get_json(&app, "/api/jobs/missing/progress").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_progress_stream() {
    let temp_dir = TempDir::new().unwrap();
    let (app, state) = app_with_script(
        &temp_dir,
        &format!("sleep 0.3\n{}", SUCCESS_SCRIPT),
    );

    state.registry.start_job("sse1").unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/jobs/sse1/progress")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let body = tokio::time::timeout(
        Duration::from_secs(10),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream did not end")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    let first = text.find(r#""percentage":25.0"#).unwrap();
    let second = text.find(r#""percentage":75.0"#).unwrap();
    let complete = text.find(r#""type":"complete""#).unwrap();
    let end = text.find("event: end").unwrap();
    assert!(first < second && second < complete && complete < end);
    assert!(text.contains(r#"{"state":"completed"}"#));
}

#[tokio::test]
async fn test_one_shot_download() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _) = app_with_script(&temp_dir, SUCCESS_SCRIPT);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/download?videoId=dl1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"My Song Live.mp3\""
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"ID3fake");
}

#[tokio::test]
async fn test_one_shot_download_failure() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _) = app_with_script(&temp_dir, FAILING_SCRIPT);

    let (status, json) = get_json(&app, "/api/download?videoId=dl2").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Download failed");
    assert_eq!(json["details"], "Video unavailable");

    let (status, json) = get_json(&app, "/api/download").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["details"], "videoId is required");
}

#[tokio::test]
async fn test_one_shot_download_cancelled_on_disconnect() {
    let temp_dir = TempDir::new().unwrap();
    let (app, state) = app_with_script(&temp_dir, LONG_SCRIPT);

    let request = app.clone().oneshot(
        Request::builder()
            .uri("/api/download?videoId=dl3")
            .body(Body::empty())
            .unwrap(),
    );
    // The client gives up while the job is still running
    let result = tokio::time::timeout(Duration::from_millis(300), request).await;
    assert!(result.is_err());

    let snapshot = state.registry.get_job("dl3").unwrap();
    assert_eq!(snapshot.state, orchestrator::JobState::Cancelled);
    assert!(state.registry.active_jobs().is_empty());

    // The id is free again
    let (status, _) = send(&app, Method::POST, "/api/jobs/dl3", Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    state.registry.cancel_job("dl3").unwrap();
}

#[tokio::test]
async fn test_queue_pause_resume() {
    let temp_dir = TempDir::new().unwrap();
    let (app, state) = app_with_script(&temp_dir, SUCCESS_SCRIPT);

    let (status, body) = send(&app, Method::POST, "/api/queue/pause", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"paused":true}"#);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/queue",
        Body::from(r#"{"ids":["q1","q2"]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["queued"], 2);

    // Nothing starts while paused
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.registry.get_job("q1").is_err());

    send(&app, Method::POST, "/api/queue/resume", Body::empty()).await;

    for _ in 0..100 {
        if state.registry.get_job("q2").is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    wait_terminal(&state, "q1").await;
    wait_terminal(&state, "q2").await;
    assert_eq!(
        state.registry.get_job("q1").unwrap().state,
        orchestrator::JobState::Completed
    );

    let (status, _) = send(&app, Method::POST, "/api/queue", Body::from(r#"{"ids":[]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
