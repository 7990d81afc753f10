//! HTTP request handlers
//!
//! Handlers stay thin: parse the request, call the services, return.

pub mod health;
pub mod metrics;
pub mod stream;
