//! # Health Check
//!
//! `GET /health` reports whether the bridge is up and how loaded it is:
//! uptime, active sessions against the configured cap, and the bridge's
//! running counters.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let active_sessions = state.bridge.active_sessions();
    let max_sessions = state.bridge.max_sessions();

    // Still "healthy" at capacity; new calls are refused but existing ones run
    let status = if active_sessions >= max_sessions { "saturated" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": active_sessions,
            "max": max_sessions
        },
        "bridge": state.bridge.stats(),
        "realtime": {
            "model": config.realtime.model,
            "api_key_configured": !config.realtime.api_key.is_empty()
        },
        "telephony": {
            "stream_endpoint_configured": state.stream_endpoint().is_some()
        }
    }))
}
