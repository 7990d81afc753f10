//! HTTP response types and utilities
//!
//! Every error leaves the service as a JSON [`ApiResponse`], with the status
//! chosen in [`handle_error`].

use std::collections::HashMap;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, ResolutionError};

/// Standard API error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Always false for errors
    pub success: bool,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
    /// Response timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ApiResponse {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error_with_details(message: String, details: HashMap<String, String>) -> Self {
        Self {
            success: false,
            error: Some(message),
            details: Some(details),
            timestamp: chrono::Utc::now(),
        }
    }
}

fn detail(key: &str, value: impl ToString) -> Option<HashMap<String, String>> {
    Some(HashMap::from([(key.to_string(), value.to_string())]))
}

/// Status code for an error, without building the response
pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation { .. } => StatusCode::BAD_REQUEST,
        AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
        AppError::AdmissionRejected(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Resolution(err) => match err {
            ResolutionError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ResolutionError::ExternalTimeout { .. } | ResolutionError::ExternalFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ResolutionError::NotFound { .. } => StatusCode::NOT_FOUND,
            ResolutionError::Restricted { .. } => StatusCode::FORBIDDEN,
        },
        AppError::UpstreamConnect { .. }
        | AppError::UpstreamStatus { .. }
        | AppError::InvalidUpstreamLocation { .. } => StatusCode::BAD_GATEWAY,
        AppError::Mux { .. } | AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert AppError to appropriate HTTP response
pub fn handle_error(error: AppError) -> Response {
    let status = status_for(&error);

    let (message, details) = match &error {
        AppError::Validation { message } => (message.clone(), None),
        AppError::Forbidden { .. } => ("Access denied".to_string(), None),
        AppError::AdmissionRejected(rejection) => (
            "Server busy, try again later".to_string(),
            detail("reason", rejection.reason()),
        ),
        AppError::Resolution(err) => match err {
            ResolutionError::InvalidInput { field, message } => {
                (format!("Invalid parameter '{field}': {message}"), None)
            }
            ResolutionError::ExternalTimeout { .. } => {
                ("Video resolution timed out".to_string(), None)
            }
            ResolutionError::ExternalFailure { .. } => {
                ("Video resolution failed".to_string(), None)
            }
            ResolutionError::NotFound { .. } => ("Video not found".to_string(), None),
            ResolutionError::Restricted { kind, .. } => {
                let mut details = HashMap::new();
                details.insert("restriction".to_string(), kind.to_string());
                details.insert("hint".to_string(), kind.hint().to_string());
                ("Video is restricted".to_string(), Some(details))
            }
        },
        AppError::UpstreamConnect { .. } => ("Failed to connect to upstream".to_string(), None),
        AppError::UpstreamStatus { stream, status } => (
            "Upstream error status".to_string(),
            Some(HashMap::from([
                ("stream".to_string(), stream.clone()),
                ("status".to_string(), status.to_string()),
            ])),
        ),
        AppError::InvalidUpstreamLocation { .. } => {
            ("Resolver returned an unusable location".to_string(), None)
        }
        AppError::Mux { .. } => ("Failed to start stream muxing".to_string(), None),
        AppError::Internal { .. } => ("Internal server error".to_string(), None),
    };

    // Internal detail stays in the log, the client gets the generic message
    if status.is_server_error() {
        warn!(kind = error.kind(), status = status.as_u16(), "Request failed: {}", error);
    } else {
        debug!(kind = error.kind(), status = status.as_u16(), "Request rejected: {}", error);
    }

    let response = match details {
        Some(details) => ApiResponse::error_with_details(message, details),
        None => ApiResponse::error(message),
    };

    (status, Json(response)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        handle_error(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AdmissionRejection, RestrictionKind};
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(AppError::validation("bad"), StatusCode::BAD_REQUEST)]
    #[case(AppError::forbidden("referer"), StatusCode::FORBIDDEN)]
    #[case(
        AdmissionRejection::QueueFull { capacity: 10 }.into(),
        StatusCode::SERVICE_UNAVAILABLE
    )]
    #[case(
        AdmissionRejection::Timeout { waited: Duration::from_secs(30) }.into(),
        StatusCode::SERVICE_UNAVAILABLE
    )]
    #[case(
        ResolutionError::InvalidInput { field: "v", message: "short".into() }.into(),
        StatusCode::BAD_REQUEST
    )]
    #[case(
        ResolutionError::ExternalTimeout { timeout: Duration::from_secs(15) }.into(),
        StatusCode::BAD_GATEWAY
    )]
    #[case(ResolutionError::external_failure("boom").into(), StatusCode::BAD_GATEWAY)]
    #[case(
        ResolutionError::NotFound { message: "gone".into() }.into(),
        StatusCode::NOT_FOUND
    )]
    #[case(
        ResolutionError::Restricted { kind: RestrictionKind::AccessBlocked, message: "geo".into() }.into(),
        StatusCode::FORBIDDEN
    )]
    #[case(AppError::upstream_connect("refused"), StatusCode::BAD_GATEWAY)]
    #[case(
        AppError::UpstreamStatus { stream: "audio".into(), status: 403 },
        StatusCode::BAD_GATEWAY
    )]
    #[case(
        AppError::InvalidUpstreamLocation { location: "file:///x".into() },
        StatusCode::BAD_GATEWAY
    )]
    #[case(AppError::mux("spawn"), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(AppError::internal("oops"), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_error_status_mapping(#[case] error: AppError, #[case] expected: StatusCode) {
        assert_eq!(status_for(&error), expected);
        assert_eq!(handle_error(error).status(), expected);
    }

    #[tokio::test]
    async fn test_validation_message_is_returned() {
        let response = handle_error(AppError::validation(
            "Failed to deserialize query string: duplicate field `v`",
        ));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("duplicate field"));
    }

    #[tokio::test]
    async fn test_restricted_body_carries_hint() {
        let response = handle_error(
            ResolutionError::Restricted {
                kind: RestrictionKind::SessionExpired,
                message: "cookies are no longer valid".into(),
            }
            .into(),
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(body["details"]["restriction"], "session_expired");
        assert_eq!(
            body["details"]["hint"],
            RestrictionKind::SessionExpired.hint()
        );
        // Raw tool output is not echoed back
        assert!(!bytes.windows(7).any(|w| w == b"cookies"));
    }
}
