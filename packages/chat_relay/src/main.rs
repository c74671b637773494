use anyhow::{Context, Result};
use axum::{Router, routing::get};
use chat_directory::MemoryDirectory;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod handlers;
mod metrics;
mod ws;

#[cfg(test)]
mod test_helpers;

use config::{CliOverrides, FileConfig, ServerConfig};
use metrics::ServerMetrics;
use ws::SessionRegistry;

/// How long shutdown waits for open connections to finish their teardown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Custom span maker that adds a unique request ID to each request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "WebSocket chat relay with channels and presence")]
struct Cli {
    /// Path to the TOML config file (optional; missing files are ignored)
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live sessions and the directory behind them
    pub registry: Arc<SessionRegistry>,
    /// Server runtime configuration
    pub server_config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

/// Build the HTTP surface: the WebSocket endpoint, health probes and, when the
/// client directory exists, static files for everything else.
pub(crate) fn app_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/ws", get(handlers::websocket_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler));

    let client_dir = &state.server_config.client_dir;
    if client_dir.is_dir() {
        app = app.fallback_service(ServeDir::new(client_dir));
    }

    app.layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "chat_relay=debug,chat_directory=debug,tower_http=debug,info"
    } else {
        "chat_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting chat relay");

    let file_config: FileConfig = config::load_config(&cli.config)
        .extract()
        .context("Failed to load configuration")?;
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
    };
    let server_config = Arc::new(ServerConfig::from_file(&file_config, &overrides)?);
    info!(
        "Server config: send_queue={}, relay_buffer={}",
        server_config.websocket.send_queue_capacity, server_config.websocket.relay_buffer_capacity
    );

    let directory = Arc::new(MemoryDirectory::new(
        server_config.websocket.relay_buffer_capacity,
    ));
    let registry = Arc::new(SessionRegistry::new(directory));
    let metrics = Arc::new(ServerMetrics::new());

    let app_state = AppState {
        registry: registry.clone(),
        server_config: server_config.clone(),
        metrics,
    };

    let app = app_router(app_state);
    if server_config.client_dir.is_dir() {
        info!(
            "Serving client files from {}",
            server_config.client_dir.display()
        );
    } else {
        warn!(
            "Client directory {} not found, static files disabled",
            server_config.client_dir.display()
        );
    }

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.bind_addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("WebSocket endpoint: ws://{}/ws", actual_addr);

    // Upgraded sockets outlive the HTTP server, so shutdown cancels them explicitly.
    let registry_for_shutdown = registry.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing connections...");
        let closed = registry_for_shutdown.close_all().await;
        info!("Signalled {} connections", closed);
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} sessions still open after shutdown timeout",
            registry.len().await
        );
    }

    info!("Shutdown complete");
    server_result
}
