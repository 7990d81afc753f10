//! Request and resolution data types
//!
//! These are plain values: built once per request, validated on
//! construction, then passed by reference or behind an `Arc`.

use std::fmt;
use std::sync::LazyLock;

use axum::http::{HeaderMap, HeaderName, header};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::errors::ResolutionError;

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern is valid")
});

/// Client headers forwarded to the media host. Everything else is dropped.
pub const FORWARDED_REQUEST_HEADERS: [HeaderName; 4] = [
    header::RANGE,
    header::IF_RANGE,
    header::USER_AGENT,
    header::ACCEPT,
];

/// Validated platform video identifier: 11 characters of `[A-Za-z0-9_-]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VideoId(String);

impl VideoId {
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        if VIDEO_ID_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ResolutionError::InvalidInput {
                field: "v",
                message: "video id must be 11 characters of letters, digits, '-' or '_'"
                    .to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Attachment file name offered to the client
    pub fn file_name(&self) -> String {
        format!("{}.mp4", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requested quality tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Unspecified,
    /// Progressive delivery up to 720p
    Standard,
    /// Up to 1080p, separate video and audio muxed together when possible
    HighDefinition,
}

impl Quality {
    /// Parse the `q` query parameter. Absent, empty or unrecognised values
    /// all mean unspecified.
    pub fn parse(raw: Option<&str>) -> Self {
        let value = raw.map(str::trim).unwrap_or_default();
        match value.to_ascii_lowercase().as_str() {
            "" => Quality::Unspecified,
            "720" | "720p" | "sd" | "standard" => Quality::Standard,
            "1080" | "1080p" | "hd" => Quality::HighDefinition,
            _ => {
                debug!(quality = value, "Unrecognised quality hint, using best available");
                Quality::Unspecified
            }
        }
    }

    /// Maximum video height for this tier
    pub fn max_height(&self) -> Option<u32> {
        match self {
            Quality::Unspecified => None,
            Quality::Standard => Some(720),
            Quality::HighDefinition => Some(1080),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Unspecified => "unspecified",
            Quality::Standard => "720",
            Quality::HighDefinition => "1080",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the media can be fetched from. Locations are usually signed URLs
/// with a short validity window, so they are only ever cached briefly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedLocation {
    /// One URL carrying both audio and video
    Progressive { url: String },
    /// Separate streams to be muxed together
    Muxed { video: String, audio: String },
}

impl ResolvedLocation {
    pub fn mode(&self) -> &'static str {
        match self {
            ResolvedLocation::Progressive { .. } => "progressive",
            ResolvedLocation::Muxed { .. } => "muxed",
        }
    }
}

/// One admitted streaming request
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub video_id: VideoId,
    pub quality: Quality,
    /// Only the allow-listed client headers
    pub forwarded_headers: HeaderMap,
}

impl StreamRequest {
    pub fn new(
        video_id: Option<&str>,
        quality: Option<&str>,
        client_headers: &HeaderMap,
    ) -> Result<Self, ResolutionError> {
        let video_id = VideoId::parse(video_id.unwrap_or_default())?;
        let quality = Quality::parse(quality);

        let mut forwarded_headers = HeaderMap::new();
        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = client_headers.get(&name) {
                forwarded_headers.insert(name, value.clone());
            }
        }

        Ok(Self {
            video_id,
            quality,
            forwarded_headers,
        })
    }
}
