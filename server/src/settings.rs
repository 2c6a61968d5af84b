//! Server settings persisted as JSON in the per-user config directory.

use orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides the bind address from the settings file
pub const BIND_ENV: &str = "AUDIOGRAB_BIND";
/// Overrides the extraction executable from the settings file
pub const EXECUTABLE_ENV: &str = "AUDIOGRAB_EXECUTABLE";

/// Settings structure for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Socket address to listen on
    pub bind: String,
    /// Jobs started through the queue endpoint run at most this many at once
    pub queue_concurrency: usize,
    /// Cancel jobs that run longer than this many seconds
    pub job_timeout_secs: Option<u64>,
    /// How jobs are launched
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            queue_concurrency: 2,
            job_timeout_secs: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl ServerSettings {
    /// Apply environment overrides, looking variables up through `var`.
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = var(BIND_ENV).filter(|v| !v.trim().is_empty()) {
            self.bind = bind.trim().to_string();
        }
        if let Some(program) = var(EXECUTABLE_ENV).filter(|v| !v.trim().is_empty()) {
            // A replacement executable takes the identifier directly
            self.orchestrator.program = PathBuf::from(program.trim());
            self.orchestrator.leading_args.clear();
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }
}

/// Default location of `settings.json`.
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("audiograb").join("settings.json"))
}

/// Load settings from disk
///
/// A missing file yields the defaults. A file that cannot be read or parsed
/// is logged and also yields the defaults.
pub async fn load_settings(path: &Path) -> ServerSettings {
    // Check if file exists
    if !path.exists() {
        return ServerSettings::default();
    }

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read settings file, using defaults");
            return ServerSettings::default();
        }
    };

    serde_json::from_str(&contents).unwrap_or_else(|e| {
        // Corrupted file: log and fall back
        tracing::warn!(path = %path.display(), error = %e, "failed to parse settings file, using defaults");
        ServerSettings::default()
    })
}

/// Save settings to disk
pub async fn save_settings(path: &Path, settings: &ServerSettings) -> std::io::Result<()> {
    // Create directory if it doesn't exist
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    tokio::fs::write(path, json).await
}
