//! ytdl-relay
//!
//! Streaming relay that turns a video identifier into media bytes: callers are
//! admitted through a bounded queue and worker pool, the identifier is
//! resolved through yt-dlp (cached briefly), and the media is either proxied
//! as a single stream or muxed from separate video and audio by ffmpeg.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod utils;
pub mod web;

pub use config::Config;
pub use errors::{AppError, AppResult};
