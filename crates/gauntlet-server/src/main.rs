//! HTTP surface for the gauntlet harness: batch endpoints plus per-session
//! log snapshot and live NDJSON streaming.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};

use gauntlet_core::broadcast::LogBroadcaster;
use gauntlet_core::config::GauntletConfig;

mod routes;

#[derive(Parser)]
#[command(
    name = "gauntlet-server",
    version,
    about = "HTTP surface for the gauntlet analysis harness"
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: SocketAddr,
    /// Path to gauntlet.toml (defaults to ./gauntlet.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

pub(crate) struct AppState {
    pub(crate) config: GauntletConfig,
    pub(crate) broadcaster: LogBroadcaster,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gauntlet_server=info,gauntlet_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GauntletConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GauntletConfig::load_or_default(),
    };

    tracing::info!(repos = config.repos.len(), "configuration loaded");

    let state = Arc::new(AppState {
        config,
        broadcaster: LogBroadcaster::new(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", cli.listen))?;
    tracing::info!("gauntlet-server listening on http://{}", cli.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/config", get(routes::get_config))
        .route("/api/input-files", post(routes::input_files))
        .route("/api/run-test", post(routes::run_test))
        .route("/api/run-all", post(routes::run_all))
        .route("/api/logs/{session_id}", get(routes::log_snapshot))
        .route("/api/logs/{session_id}/stream", get(routes::log_stream))
        .layer(cors)
        .with_state(state)
}
