use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub mod defaults;
pub mod duration_serde;

use crate::services::classifier::ClassificationRule;
use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Two-stage admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Total requests held open, waiting plus active
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Concurrently active heavy operations
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// How long a queued request may wait for a pool slot
    #[serde(default = "default_admit_timeout", with = "duration_serde::duration")]
    pub admit_timeout: Duration,
}

/// How the resolution tool reports its result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// `-g`: one fetch URL per line
    #[default]
    Urls,
    /// `-J`: JSON format catalog, selection done in-process
    Catalog,
}

/// What to do when a high-definition request cannot be served as separate
/// video and audio streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HdFallback {
    /// Serve the best progressive stream instead
    #[default]
    Progressive,
    /// Report a resolution failure
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_command")]
    pub command: String,
    #[serde(default = "default_resolver_timeout", with = "duration_serde::duration")]
    pub timeout: Duration,
    #[serde(default = "default_cache_ttl", with = "duration_serde::duration")]
    pub cache_ttl: Duration,
    /// Most resolutions kept at once, least recently used go first
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Prefix the video id is appended to
    #[serde(default = "default_watch_url")]
    pub watch_url: String,
    /// Netscape cookie file handed to the resolution tool as-is
    #[serde(default)]
    pub cookies_path: Option<PathBuf>,
    #[serde(default)]
    pub hd_fallback: HdFallback,
    /// Extra error classification rules, checked before the built-in ones
    #[serde(default)]
    pub classification_rules: Vec<ClassificationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bounds TCP connect and TLS handshake
    #[serde(default = "default_connect_timeout", with = "duration_serde::duration")]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_response_header_timeout",
        with = "duration_serde::duration"
    )]
    pub response_header_timeout: Duration,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Sent upstream when the client did not supply one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    #[serde(default = "default_true")]
    pub mux_enabled: bool,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(
        default = "default_bridge_accept_timeout",
        with = "duration_serde::duration"
    )]
    pub bridge_accept_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When set, the Referer header must contain this substring
    #[serde(default)]
    pub allowed_referer_substring: Option<String>,
    /// When set, callers must present it via `X-Api-Key` or `api_key`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Require `X-Requested-With: XMLHttpRequest`
    #[serde(default)]
    pub require_xhr: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_admit_timeout() -> Duration {
    DEFAULT_ADMIT_TIMEOUT
}

fn default_resolver_command() -> String {
    DEFAULT_RESOLVER_COMMAND.to_string()
}

fn default_resolver_timeout() -> Duration {
    DEFAULT_RESOLVER_TIMEOUT
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_watch_url() -> String {
    DEFAULT_WATCH_URL.to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_response_header_timeout() -> Duration {
    DEFAULT_RESPONSE_HEADER_TIMEOUT
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

fn default_true() -> bool {
    true
}

fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}

fn default_bridge_accept_timeout() -> Duration {
    DEFAULT_BRIDGE_ACCEPT_TIMEOUT
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            pool_capacity: default_pool_capacity(),
            admit_timeout: default_admit_timeout(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            command: default_resolver_command(),
            timeout: default_resolver_timeout(),
            cache_ttl: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            output_mode: OutputMode::default(),
            watch_url: default_watch_url(),
            cookies_path: None,
            hd_fallback: HdFallback::default(),
            classification_rules: Vec::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            response_header_timeout: default_response_header_timeout(),
            buffer_size: default_buffer_size(),
            user_agent: default_user_agent(),
            ffmpeg_command: default_ffmpeg_command(),
            mux_enabled: true,
            audio_codec: default_audio_codec(),
            bridge_accept_timeout: default_bridge_accept_timeout(),
        }
    }
}

/// Flat environment names kept from the original deployment, mapped onto
/// their place in the nested configuration.
const LEGACY_ENV_KEYS: &[&str] = &[
    "PORT",
    "QUEUE_CAPACITY",
    "POOL_CAPACITY",
    "ADMIT_TIMEOUT",
    "ALLOWED_REFERER_SUBSTRING",
    "API_KEY",
    "YTDLP_COOKIES",
];

impl Config {
    /// Layered sources: defaults, then the TOML file (if present), then
    /// `YTDL_RELAY_<SECTION>__<KEY>` environment variables.
    pub fn figment(config_file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let path = Path::new(config_file);
        if path.exists() {
            info!("Loading configuration from {}", config_file);
        } else {
            debug!("No configuration file at {}, using defaults", config_file);
        }

        let mut config: Config = Self::figment(path).extract()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment layering.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(contents))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the flat legacy environment names. These win over the file and
    /// prefixed variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in LEGACY_ENV_KEYS {
            let Some(raw) = lookup(key) else { continue };
            let value = raw.trim();
            if value.is_empty() {
                continue;
            }

            match *key {
                "PORT" => self.web.port = value.parse()?,
                "QUEUE_CAPACITY" => self.admission.queue_capacity = value.parse()?,
                "POOL_CAPACITY" => self.admission.pool_capacity = value.parse()?,
                "ADMIT_TIMEOUT" => {
                    self.admission.admit_timeout = match value.parse::<u64>() {
                        Ok(seconds) => Duration::from_secs(seconds),
                        Err(_) => humantime::parse_duration(value)?,
                    }
                }
                "ALLOWED_REFERER_SUBSTRING" => {
                    self.security.allowed_referer_substring = Some(value.to_string())
                }
                "API_KEY" => self.security.api_key = Some(value.to_string()),
                "YTDLP_COOKIES" => self.resolver.cookies_path = Some(PathBuf::from(value)),
                _ => {}
            }
            debug!("Configuration override from environment: {}", key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.admission.pool_capacity == 0 {
            bail!("admission.pool_capacity must be at least 1");
        }
        if self.admission.queue_capacity < self.admission.pool_capacity {
            bail!(
                "admission.queue_capacity ({}) must not be smaller than admission.pool_capacity ({})",
                self.admission.queue_capacity,
                self.admission.pool_capacity
            );
        }
        if self.resolver.cache_capacity == 0 {
            bail!("resolver.cache_capacity must be at least 1");
        }
        if self.relay.buffer_size == 0 {
            bail!("relay.buffer_size must be greater than zero");
        }
        if self.resolver.command.trim().is_empty() {
            bail!("resolver.command must not be empty");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
