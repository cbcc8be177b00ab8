//! Host status endpoint
//!
//! - GET /status - version, uptime, request and guest call counters

use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::middleware::AppState;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    /// RFC 3339 start time
    pub started_at: String,
    pub uptime_seconds: u64,
    /// e.g. "2h 15m"
    pub uptime_formatted: String,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    /// Guest export calls made since startup
    pub guest_calls: u64,
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = &state.request_stats;
    let uptime_seconds = stats.uptime_seconds();

    Json(StatusResponse {
        version: APP_VERSION.to_string(),
        started_at: stats.started_at().to_rfc3339(),
        uptime_seconds,
        uptime_formatted: format_uptime(uptime_seconds),
        total_requests: stats.total_requests(),
        avg_response_time_ms: stats.avg_response_time_us() / 1000.0,
        guest_calls: state.bridge.calls(),
    })
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;

    match (days, hours, minutes) {
        (0, 0, 0) => format!("{}s", seconds),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, m) => format!("{}d {}h {}m", d, h, m),
    }
}
