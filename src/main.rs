use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ytdl_relay::{
    config::Config,
    services::{MuxPipeline, YtDlpBackend},
    web::{AppState, WebServer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser)]
#[command(name = "ytdl-relay")]
#[command(version)]
#[command(about = "Admission-controlled relay that resolves video ids and streams the media")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", env = "CONFIG_FILE")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "json", env = "LOG_FORMAT")]
    log_format: LogFormat,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

fn init_logging(cli: &Cli) {
    let log_filter = format!("ytdl_relay={}", cli.log_level);
    let json = cli.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = Config::load_from_file(&cli.config)?;

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    config.validate()?;

    if cli.dump_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    info!("Starting ytdl-relay v{}", env!("CARGO_PKG_VERSION"));

    let mux_available = if config.relay.mux_enabled {
        let found = MuxPipeline::check_available(&config.relay.ffmpeg_command).await;
        if !found {
            warn!(
                command = %config.relay.ffmpeg_command,
                "ffmpeg unavailable, high definition requests fall back to progressive streams"
            );
        }
        found
    } else {
        info!("Muxing disabled by configuration");
        false
    };

    let backend = Arc::new(YtDlpBackend::new(&config.resolver)?);
    info!(
        command = %config.resolver.command,
        output_mode = ?config.resolver.output_mode,
        cookies = config.resolver.cookies_path.is_some(),
        cache_capacity = config.resolver.cache_capacity,
        "Resolution backend initialized"
    );

    info!(
        queue_capacity = config.admission.queue_capacity,
        pool_capacity = config.admission.pool_capacity,
        admit_timeout = %humantime::format_duration(config.admission.admit_timeout),
        "Admission control configured"
    );

    let state = AppState::new(config, backend, mux_available)?;
    let web_server = WebServer::new(state)?;

    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve_with_cancellation(None).await?;

    info!("Shutdown complete");
    Ok(())
}
