//! Error type definitions for the relay
//!
//! The hierarchy is shallow: [`AppError`] is what handlers return,
//! [`ResolutionError`] and [`AdmissionRejection`] are produced by their
//! respective services and convert into it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed request parameters
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Caller failed the access guard
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Admission control refused the request
    #[error("Admission rejected: {0}")]
    AdmissionRejected(#[from] AdmissionRejection),

    /// Resolution of the identifier failed
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// The media host could not be reached or did not answer in time
    #[error("Upstream connection failed: {message}")]
    UpstreamConnect { message: String },

    /// The media host answered a mux sub-request with a non-success status
    #[error("Upstream returned {status} for {stream}")]
    UpstreamStatus { stream: String, status: u16 },

    /// The resolver returned something that is not an http(s) URL
    #[error("Invalid upstream location: {location}")]
    InvalidUpstreamLocation { location: String },

    /// The re-encoder could not be started or wired up
    #[error("Mux pipeline error: {message}")]
    Mux { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn upstream_connect<S: Into<String>>(message: S) -> Self {
        Self::UpstreamConnect {
            message: message.into(),
        }
    }

    pub fn mux<S: Into<String>>(message: S) -> Self {
        Self::Mux {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "invalid_input",
            AppError::Forbidden { .. } => "forbidden",
            AppError::AdmissionRejected(rejection) => rejection.reason(),
            AppError::Resolution(err) => err.kind(),
            AppError::UpstreamConnect { .. } => "upstream_connect_failure",
            AppError::UpstreamStatus { .. } => "upstream_status",
            AppError::InvalidUpstreamLocation { .. } => "invalid_upstream_location",
            AppError::Mux { .. } => "mux_failure",
            AppError::Internal { .. } => "internal",
        }
    }
}

/// Why the admission controller turned a request away
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    /// Every queue slot was taken, rejected without waiting
    #[error("queue is full ({capacity} requests already held)")]
    QueueFull { capacity: usize },

    /// A queue slot was held but no pool slot freed up in time
    #[error("no worker became available within {waited:?}")]
    Timeout { waited: Duration },
}

impl AdmissionRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionRejection::QueueFull { .. } => "queue_full",
            AdmissionRejection::Timeout { .. } => "admit_timeout",
        }
    }
}

/// Classified reason a video is inaccessible to the resolution tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionKind {
    /// Sign-in, age or membership gate; fresh credentials may help
    CredentialsRequired,
    /// Region or host level block
    AccessBlocked,
    /// Credentials were supplied but are no longer accepted
    SessionExpired,
}

impl RestrictionKind {
    /// Operator-facing hint returned alongside the 403
    pub fn hint(&self) -> &'static str {
        match self {
            RestrictionKind::CredentialsRequired => {
                "The video requires a signed-in session; refresh the resolver credentials and retry"
            }
            RestrictionKind::AccessBlocked => {
                "Access to this video is blocked from this host or region"
            }
            RestrictionKind::SessionExpired => {
                "The resolver session has expired; re-export the credentials file"
            }
        }
    }
}

impl fmt::Display for RestrictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestrictionKind::CredentialsRequired => "credentials_required",
            RestrictionKind::AccessBlocked => "access_blocked",
            RestrictionKind::SessionExpired => "session_expired",
        };
        f.write_str(label)
    }
}

/// Resolver failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Malformed identifier or quality hint, nothing was looked up
    #[error("invalid {field}: {message}")]
    InvalidInput { field: &'static str, message: String },

    /// The resolution tool did not finish before its deadline
    #[error("resolution timed out after {timeout:?}")]
    ExternalTimeout { timeout: Duration },

    /// The resolution tool failed or produced nothing usable
    #[error("resolution failed: {message}")]
    ExternalFailure { message: String },

    /// The video does not exist or was removed
    #[error("video not found: {message}")]
    NotFound { message: String },

    /// The video exists but cannot be accessed from here
    #[error("video restricted ({kind}): {message}")]
    Restricted {
        kind: RestrictionKind,
        message: String,
    },
}

impl ResolutionError {
    pub fn external_failure<S: Into<String>>(message: S) -> Self {
        Self::ExternalFailure {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionError::InvalidInput { .. } => "invalid_input",
            ResolutionError::ExternalTimeout { .. } => "resolution_timeout",
            ResolutionError::ExternalFailure { .. } => "resolution_failure",
            ResolutionError::NotFound { .. } => "not_found",
            ResolutionError::Restricted { .. } => "restricted",
        }
    }
}
