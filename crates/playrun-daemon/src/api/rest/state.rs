//! Application state for API handlers

use crate::config::ServerConfig;
use playrun_core::Runner;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Runner core
    pub runner: Arc<Runner>,

    /// Keep-alive interval of event streams
    pub keep_alive: Duration,

    /// Daemon version
    pub version: String,

    /// Daemon start time
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Create new application state
    pub fn new(runner: Arc<Runner>, server: &ServerConfig) -> Self {
        Self {
            runner,
            keep_alive: Duration::from_secs(server.stream_keep_alive_secs.max(1)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds().max(0);
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
