//! Web layer module
//!
//! HTTP surface of the relay: the streaming endpoint behind the access guard
//! and admission control, plus health and metrics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{Router, middleware::from_fn, middleware::from_fn_with_state, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::errors::AppResult;
use crate::services::admission::AdmissionController;
use crate::services::mux::MuxPipeline;
use crate::services::relay::{OutboundClient, StreamRelay};
use crate::services::resolver::{ResolutionBackend, StreamResolver};

pub mod handlers;
pub mod middleware;
pub mod responses;

pub use middleware::AccessGuard;
pub use responses::{ApiResponse, handle_error};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub admission: Arc<AdmissionController>,
    pub resolver: StreamResolver,
    pub relay: StreamRelay,
    /// Present only when ffmpeg was found and muxing is enabled
    pub mux: Option<MuxPipeline>,
    pub access_guard: Arc<AccessGuard>,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        backend: Arc<dyn ResolutionBackend>,
        mux_available: bool,
    ) -> AppResult<Self> {
        let client = OutboundClient::new(&config.relay)?;
        let mux = mux_available.then(|| MuxPipeline::new(client.clone(), &config.relay));

        Ok(Self {
            admission: Arc::new(AdmissionController::new(&config.admission)),
            resolver: StreamResolver::new(backend, &config.resolver, mux.is_some()),
            relay: StreamRelay::new(client, &config.relay),
            mux,
            access_guard: Arc::new(AccessGuard::new(&config.security)),
            start_time: chrono::Utc::now(),
            config: Arc::new(config),
        })
    }
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Layers run outermost-last: guard, then parameter validation, then admission
    let stream_route = get(handlers::stream::stream_video)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admission_middleware,
        ))
        .layer(from_fn(middleware::stream_request_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::access_guard_middleware,
        ));

    Router::new()
        .route("/api/stream", stream_route)
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .layer(from_fn(middleware::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", state.config.web.host, state.config.web.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
        Ok(Self {
            app: create_router(state),
            addr,
        })
    }

    /// Get the host address
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve until the token is cancelled, or until SIGINT/SIGTERM when no
    /// token is given. In-flight responses are allowed to finish.
    pub async fn serve_with_cancellation(
        self,
        cancellation_token: Option<CancellationToken>,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.addr, e))?;
        info!("Listening on {}", self.addr);

        let shutdown_signal = async move {
            match &cancellation_token {
                Some(token) => {
                    token.cancelled().await;
                    info!("Web server received cancellation signal, shutting down gracefully");
                }
                None => wait_for_shutdown_signal().await,
            }
        };

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await?;
        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
            }
            _ => {
                error!("Failed to install signal handlers, graceful shutdown disabled");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
