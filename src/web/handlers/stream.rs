//! Media streaming endpoint

use axum::{
    Extension,
    extract::State,
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::{AppError, AppResult};
use crate::models::{ResolvedLocation, StreamRequest};
use crate::web::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Video identifier
    pub v: Option<String>,
    /// Quality hint
    pub q: Option<String>,
}

/// `GET /api/stream?v=<id>&q=<quality>`
///
/// Runs behind the access guard, parameter validation and admission control.
/// Resolves the id, then either relays the single progressive stream or
/// muxes video and audio.
pub async fn stream_video(
    State(state): State<AppState>,
    Extension(request): Extension<StreamRequest>,
) -> AppResult<Response> {
    debug!(video_id = %request.video_id, quality = %request.quality, "Stream requested");

    let location = state
        .resolver
        .resolve(&request.video_id, request.quality)
        .await?;

    match location.as_ref() {
        ResolvedLocation::Progressive { url } => {
            state
                .relay
                .relay(url, &request.forwarded_headers, &request.video_id)
                .await
        }
        ResolvedLocation::Muxed { video, audio } => match &state.mux {
            Some(mux) => {
                mux.relay_muxed(video, audio, &request.forwarded_headers, &request.video_id)
                    .await
            }
            None => {
                error!(video_id = %request.video_id, "Muxed location resolved while muxing is disabled");
                Err(AppError::internal("muxing is not available"))
            }
        },
    }
}
