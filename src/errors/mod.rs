//! Centralized error handling for the relay
//!
//! Every failure a request can hit is an [`AppError`]. Handlers return
//! [`AppResult`] and the web layer maps the error to a status code and a
//! JSON body in one place (`web::responses::handle_error`).
//!
//! # Error Categories
//!
//! - **Validation**: malformed identifiers or quality hints
//! - **Admission**: queue full or pool wait timed out
//! - **Resolution**: the external resolution tool timed out, failed, or
//!   reported the video missing or restricted
//! - **Upstream**: the media host could not be reached or returned an
//!   unusable location
//! - **Mux**: the re-encoder could not be started

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for resolver Results
pub type ResolutionResult<T> = Result<T, ResolutionError>;
