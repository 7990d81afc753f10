use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::services::admission::AdmissionController;
use crate::web::AppState;

/// Prometheus text exposition of the admission gauges
pub fn render_metrics(admission: &AdmissionController) -> String {
    format!(
        "# HELP active_downloads Streaming operations currently holding a worker slot.\n\
         # TYPE active_downloads gauge\n\
         active_downloads {}\n\
         # HELP queued_downloads Requests waiting for a worker slot.\n\
         # TYPE queued_downloads gauge\n\
         queued_downloads {}\n",
        admission.active(),
        admission.queued()
    )
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_metrics(&state.admission),
    )
        .into_response()
}
