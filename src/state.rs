//! # Application State Management
//!
//! Shared state handed to every HTTP and WebSocket handler through
//! `web::Data<AppState>`.
//!
//! ## Arc Pattern
//! - **config**: Loaded once at startup and read-only afterwards, so a plain
//!   `Arc<AppConfig>` is enough
//! - **bridge**: The session registry; it does its own locking internally
//!
//! Cloning `AppState` only bumps reference counts, which is what actix does
//! for each worker thread.

use crate::bridge::SessionBridge;
use crate::config::AppConfig;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Registry of active call sessions
    pub bridge: Arc<SessionBridge>,

    /// When the server started, for the uptime reported by `/health`
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, bridge: Arc<SessionBridge>) -> Self {
        Self {
            config: Arc::new(config),
            bridge,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Base URL callers' media streams should connect to, or `None` when the
    /// deployment has not configured one.
    pub fn stream_endpoint(&self) -> Option<&str> {
        let endpoint = self.config.telephony.stream_endpoint.trim();
        (!endpoint.is_empty()).then_some(endpoint)
    }
}
