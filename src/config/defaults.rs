/// Configuration default values
///
/// All default values for configuration options live here so they can be
/// changed in one place.
use std::time::Duration;

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

// Admission defaults
pub const DEFAULT_QUEUE_CAPACITY: usize = 10; // waiting + active
pub const DEFAULT_POOL_CAPACITY: usize = 5;
pub const DEFAULT_ADMIT_TIMEOUT: Duration = Duration::from_secs(30);

// Resolver defaults
pub const DEFAULT_RESOLVER_COMMAND: &str = "yt-dlp";
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_WATCH_URL: &str = "https://www.youtube.com/watch?v=";

// Relay defaults
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
pub const DEFAULT_BRIDGE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

// Environment
pub const ENV_PREFIX: &str = "YTDL_RELAY_";
