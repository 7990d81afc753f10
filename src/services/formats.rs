//! Format selection
//!
//! Maps a [`Quality`] to selection criteria, renders those criteria as a
//! yt-dlp format expression, and interprets what the tool hands back: either
//! plain URL lines or a JSON catalog of formats ranked here.

use serde::Deserialize;

use crate::config::HdFallback;
use crate::errors::ResolutionError;
use crate::models::{Quality, ResolvedLocation};

/// What the resolver should ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criteria {
    /// Best single stream, optionally capped in height
    Progressive { max_height: Option<u32> },
    /// Best video-only plus best audio-only stream within the cap
    Muxed { max_height: u32, fallback: HdFallback },
}

impl Criteria {
    pub fn for_quality(quality: Quality, mux_available: bool, fallback: HdFallback) -> Self {
        match (quality, mux_available) {
            (Quality::HighDefinition, true) => Criteria::Muxed {
                max_height: 1080,
                fallback,
            },
            _ => Criteria::Progressive {
                max_height: quality.max_height(),
            },
        }
    }

    /// yt-dlp `-f` expression
    pub fn format_selector(&self) -> String {
        match self {
            Criteria::Progressive { max_height: None } => "best[ext=mp4]".to_string(),
            Criteria::Progressive {
                max_height: Some(height),
            } => format!("best[ext=mp4][height<={height}]/best[ext=mp4]"),
            Criteria::Muxed {
                max_height,
                fallback,
            } => {
                let mut selector = format!(
                    "bestvideo[ext=mp4][height<={max_height}]+bestaudio[ext=m4a]/bestvideo[ext=mp4][height<={max_height}]+bestaudio"
                );
                if *fallback == HdFallback::Progressive {
                    selector.push_str(&format!(
                        "/best[ext=mp4][height<={max_height}]/best[ext=mp4]"
                    ));
                }
                selector
            }
        }
    }

    /// Interpret `-g` output. Only the first non-empty line (two for muxed
    /// criteria) is used, so stray extra lines never reach a header.
    pub fn interpret_lines(&self, output: &str) -> Result<ResolvedLocation, ResolutionError> {
        let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());

        match self {
            Criteria::Progressive { .. } => lines
                .next()
                .map(|url| ResolvedLocation::Progressive {
                    url: url.to_string(),
                })
                .ok_or_else(|| ResolutionError::external_failure("resolver returned an empty URL")),
            Criteria::Muxed { fallback, .. } => match (lines.next(), lines.next()) {
                (Some(video), Some(audio)) => Ok(ResolvedLocation::Muxed {
                    video: video.to_string(),
                    audio: audio.to_string(),
                }),
                (Some(url), None) if *fallback == HdFallback::Progressive => {
                    Ok(ResolvedLocation::Progressive {
                        url: url.to_string(),
                    })
                }
                (Some(_), None) => Err(ResolutionError::external_failure(
                    "no separate video and audio streams available",
                )),
                _ => Err(ResolutionError::external_failure(
                    "resolver returned an empty URL",
                )),
            },
        }
    }
}

/// One entry of the `formats` array in yt-dlp's JSON output
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormatEntry {
    pub url: Option<String>,
    pub ext: Option<String>,
    pub protocol: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    /// Total bitrate, kbit/s
    pub tbr: Option<f64>,
    /// Audio bitrate, kbit/s
    pub abr: Option<f64>,
}

impl FormatEntry {
    fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(codec) if codec != "none")
    }

    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(codec) if codec != "none")
    }

    fn is_mp4(&self) -> bool {
        self.ext.as_deref() == Some("mp4")
    }

    /// Plain HTTP delivery; manifests and storyboards are excluded
    fn is_direct(&self) -> bool {
        let url_ok = self
            .url
            .as_deref()
            .is_some_and(|u| u.starts_with("https://") || u.starts_with("http://"));
        let protocol_ok = matches!(self.protocol.as_deref(), None | Some("https") | Some("http"));
        url_ok && protocol_ok
    }

    fn within(&self, max_height: Option<u32>) -> bool {
        match (max_height, self.height) {
            (None, _) => true,
            (Some(cap), Some(height)) => height <= cap,
            (Some(_), None) => false,
        }
    }

    fn video_rank(&self) -> (u32, u64) {
        (self.height.unwrap_or(0), bitrate_key(self.tbr))
    }

    fn audio_rank(&self) -> u64 {
        bitrate_key(self.abr.or(self.tbr))
    }

    fn location(&self) -> String {
        self.url.clone().unwrap_or_default()
    }
}

fn bitrate_key(kbps: Option<f64>) -> u64 {
    kbps.map(|v| (v * 1000.0).max(0.0) as u64).unwrap_or(0)
}

/// yt-dlp `-J` document, reduced to what format selection needs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatCatalog {
    #[serde(default)]
    pub formats: Vec<FormatEntry>,
}

impl FormatCatalog {
    pub fn from_json(raw: &str) -> Result<Self, ResolutionError> {
        serde_json::from_str(raw).map_err(|e| {
            ResolutionError::external_failure(format!("unparseable format catalog: {e}"))
        })
    }

    /// Progressive mp4 formats, best first
    pub fn progressive(&self, max_height: Option<u32>) -> Vec<&FormatEntry> {
        let mut found: Vec<&FormatEntry> = self
            .formats
            .iter()
            .filter(|f| f.has_video() && f.has_audio() && f.is_mp4() && f.is_direct())
            .filter(|f| f.within(max_height))
            .collect();
        found.sort_by(|a, b| b.video_rank().cmp(&a.video_rank()));
        found
    }

    /// Video-only mp4 formats, best first
    pub fn video_only(&self, max_height: u32) -> Vec<&FormatEntry> {
        let mut found: Vec<&FormatEntry> = self
            .formats
            .iter()
            .filter(|f| f.has_video() && !f.has_audio() && f.is_mp4() && f.is_direct())
            .filter(|f| f.within(Some(max_height)))
            .collect();
        found.sort_by(|a, b| b.video_rank().cmp(&a.video_rank()));
        found
    }

    /// Audio-only formats, highest bitrate first
    pub fn audio_only(&self) -> Vec<&FormatEntry> {
        let mut found: Vec<&FormatEntry> = self
            .formats
            .iter()
            .filter(|f| f.has_audio() && !f.has_video() && f.is_direct())
            .collect();
        found.sort_by_key(|f| std::cmp::Reverse(f.audio_rank()));
        found
    }

    pub fn select(&self, criteria: &Criteria) -> Result<ResolvedLocation, ResolutionError> {
        match criteria {
            Criteria::Progressive { max_height } => self.best_progressive(*max_height),
            Criteria::Muxed {
                max_height,
                fallback,
            } => {
                let video = self.video_only(*max_height);
                let audio = self.audio_only();
                match (video.first(), audio.first()) {
                    (Some(v), Some(a)) => Ok(ResolvedLocation::Muxed {
                        video: v.location(),
                        audio: a.location(),
                    }),
                    _ if *fallback == HdFallback::Progressive => {
                        self.best_progressive(Some(*max_height))
                    }
                    _ => Err(ResolutionError::external_failure(
                        "no separate video and audio streams available",
                    )),
                }
            }
        }
    }

    /// Best progressive within the cap, else the best progressive overall
    fn best_progressive(
        &self,
        max_height: Option<u32>,
    ) -> Result<ResolvedLocation, ResolutionError> {
        let capped = self.progressive(max_height);
        let chosen = match capped.first() {
            Some(format) => Some(*format),
            None => self.progressive(None).first().copied(),
        };
        chosen
            .map(|f| ResolvedLocation::Progressive { url: f.location() })
            .ok_or_else(|| ResolutionError::external_failure("no progressive format available"))
    }
}
