use crate::settings::ServerSettings;
use orchestrator::JobRegistry;
use std::time::Instant;

/// Application state shared by all route handlers
pub struct AppState {
    /// Active and recently finished download jobs
    pub registry: JobRegistry,
    /// Settings the server was started with
    pub settings: ServerSettings,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            registry: JobRegistry::new(settings.orchestrator.clone()),
            settings,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
