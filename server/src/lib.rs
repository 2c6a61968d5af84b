//! Audiograb server library.
//!
//! Axum-based HTTP layer over the orchestrator: job control, live progress
//! over server-sent events, and artifact download.

pub mod error;
pub mod routes;
pub mod settings;
pub mod state;

pub use error::{ApiError, ErrorResponse};
pub use routes::api_routes;
pub use settings::ServerSettings;
pub use state::AppState;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and request tracing.
pub fn create_app(state: Arc<AppState>) -> Router {
    api_routes(state).layer(TraceLayer::new_for_http())
}

/// Load settings, bind, and serve until the process is stopped.
///
/// # Errors
///
/// Returns an error if the bind address is invalid or cannot be bound.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match settings::settings_path() {
        Some(path) => {
            if !path.exists() {
                // First run: leave an editable copy of the defaults
                if let Err(e) = settings::save_settings(&path, &ServerSettings::default()).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write default settings");
                }
            }
            settings::load_settings(&path).await
        }
        None => ServerSettings::default(),
    };
    settings.apply_env();

    if let Err(e) = orchestrator::registry::resolve_program(&settings.orchestrator) {
        tracing::warn!(error = %e, "extraction executable is not usable; jobs will fail to start");
    }

    let bind = settings.bind.clone();
    let state = Arc::new(AppState::new(settings));
    let app = create_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }

    state.registry.gate().pause();
    let cancelled = state
        .registry
        .cancel_all(orchestrator::CancelReason::Requested);
    tracing::info!(cancelled, "shutting down");
}
