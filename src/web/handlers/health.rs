use axum::{Json, extract::State};
use serde::Serialize;

use crate::web::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub mux_available: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Liveness check, always 200
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (now - state.start_time).num_seconds().max(0),
        mux_available: state.mux.is_some(),
        timestamp: now,
    })
}
