//! HTTP middleware
//!
//! Request logging, the access guard and admission control. The logging and
//! admission layers move their state into the response body so that it lives
//! until the transfer is over, not just until the handler returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, Method, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::AppState;
use crate::config::SecurityConfig;
use crate::errors::AppError;
use crate::models::StreamRequest;
use crate::utils::body_stream::{GuardedStream, MeteredStream, TransferOutcome, TransferStats};
use crate::web::handlers::stream::StreamQuery;

const HEALTH_PATH: &str = "/health";
const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_PARAM: &str = "api_key";

/// Emits the request log line once the response body is finished or dropped
struct RequestLogRecord {
    request_id: String,
    method: Method,
    path: String,
    query: String,
    status: u16,
    remote: String,
    user_agent: String,
    transfer: Arc<TransferStats>,
    start: Instant,
}

impl RequestLogRecord {
    fn summary(&self) -> Option<&'static str> {
        match self.transfer.outcome() {
            TransferOutcome::Failed => Some("HTTP response body failed partway through"),
            TransferOutcome::Aborted => Some("HTTP response aborted before the body was sent"),
            TransferOutcome::Complete if self.status >= 400 => {
                Some("HTTP request completed with error")
            }
            TransferOutcome::Complete => None,
        }
    }
}

impl Drop for RequestLogRecord {
    fn drop(&mut self) {
        let bytes = self.transfer.bytes();
        let outcome = self.transfer.outcome().as_str();
        let duration_ms = self.start.elapsed().as_millis() as u64;

        match self.summary() {
            Some(summary) => warn!(
                request_id = %self.request_id,
                method = %self.method,
                path = %self.path,
                query = %self.query,
                status = self.status,
                bytes,
                outcome,
                duration_ms,
                remote = %self.remote,
                ua = %self.user_agent,
                "{}",
                summary
            ),
            None => info!(
                request_id = %self.request_id,
                method = %self.method,
                path = %self.path,
                query = %self.query,
                status = self.status,
                bytes,
                outcome,
                duration_ms,
                remote = %self.remote,
                ua = %self.user_agent,
                "HTTP request completed"
            ),
        }
    }
}

/// Request logging middleware
///
/// Logs every request except the health check, with the number of body
/// bytes actually sent.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = redact_query(request.uri().query().unwrap_or_default());
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();

    let transfer = Arc::new(TransferStats::default());
    let record = RequestLogRecord {
        request_id: uuid::Uuid::new_v4().to_string(),
        method,
        path,
        query,
        status: parts.status.as_u16(),
        remote,
        user_agent,
        transfer: transfer.clone(),
        start,
    };

    let body = GuardedStream::new(MeteredStream::new(body.into_data_stream(), transfer), record);
    Response::from_parts(parts, Body::from_stream(body))
}

/// Replace the value of any `api_key` parameter so keys never reach the log
pub fn redact_query(query: &str) -> String {
    query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((API_KEY_PARAM, _)) => format!("{API_KEY_PARAM}=REDACTED"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Optional caller checks: Referer substring, XHR marker and API key.
/// Each check is skipped when it is not configured.
#[derive(Debug, Clone, Default)]
pub struct AccessGuard {
    referer_substring: Option<String>,
    api_key: Option<String>,
    require_xhr: bool,
}

impl AccessGuard {
    pub fn new(config: &SecurityConfig) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            referer_substring: non_empty(&config.allowed_referer_substring),
            api_key: non_empty(&config.api_key),
            require_xhr: config.require_xhr,
        }
    }

    pub fn check(&self, headers: &HeaderMap, query: Option<&str>) -> Result<(), AppError> {
        if let Some(expected) = &self.referer_substring {
            let referer = headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !referer.contains(expected.as_str()) {
                return Err(AppError::forbidden("referer not allowed"));
            }
        }

        if self.require_xhr {
            let requested_with = headers
                .get("x-requested-with")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if requested_with != "XMLHttpRequest" {
                return Err(AppError::forbidden("missing X-Requested-With"));
            }
        }

        if let Some(expected) = &self.api_key {
            let provided = headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
                .or_else(|| {
                    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
                        .find(|(key, _)| key == API_KEY_PARAM)
                        .map(|(_, value)| value.into_owned())
                })
                .unwrap_or_default();

            if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
                return Err(AppError::forbidden("invalid api key"));
            }
        }

        Ok(())
    }
}

/// Rejects callers failing the access guard before they can take a slot
pub async fn access_guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(err) = state
        .access_guard
        .check(request.headers(), request.uri().query())
    {
        warn!(path = %request.uri().path(), "Access guard rejected request: {}", err);
        return Err(err);
    }
    Ok(next.run(request).await)
}

/// Parses and validates the stream parameters before a slot is taken, so
/// malformed requests are refused immediately even when the server is busy.
/// The parsed [`StreamRequest`] is handed on as a request extension.
pub async fn stream_request_middleware(
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Query(query) = Query::<StreamQuery>::try_from_uri(request.uri())
        .map_err(|rejection| AppError::validation(rejection.body_text()))?;
    let stream_request =
        StreamRequest::new(query.v.as_deref(), query.q.as_deref(), request.headers())?;

    request.extensions_mut().insert(stream_request);
    Ok(next.run(request).await)
}

/// Admission control middleware
///
/// Takes a queue and pool slot before the handler runs and releases them
/// when the response body is done.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ticket = state.admission.admit().await?;

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let body = GuardedStream::new(body.into_data_stream(), ticket);
    Ok(Response::from_parts(parts, Body::from_stream(body)))
}
