mod routes;
mod state;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use loadmesh_core::config::MasterConfig;
use loadmesh_core::coordinator::Coordinator;
use loadmesh_core::registry::Registry;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use state::{AppState, ConnectionTable};

#[derive(Debug, Parser)]
#[command(name = "loadmesh-master", about = "Coordinates distributed load-generation executions")]
struct Cli {
    /// Path to a YAML config file layered under defaults and environment
    /// variables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config's bind_address, e.g. "0.0.0.0:7070".
    #[arg(long)]
    bind_address: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = MasterConfig::load(cli.config.as_deref()).expect("failed to load config");
    if let Some(bind_address) = cli.bind_address {
        config.bind_address = bind_address;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let registry = Registry::new();
    let connections = ConnectionTable::new();
    let coordinator = Coordinator::new(registry.clone(), Arc::new(connections.clone()));

    let heartbeat_timeout = chrono::Duration::seconds(config.heartbeat_timeout_secs as i64);
    let sweeper_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            sweeper_registry.sweep_stale(heartbeat_timeout).await;
        }
    });

    let state = Arc::new(AppState {
        registry,
        coordinator,
        connections,
        config: config.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/slaves", get(routes::list_slaves).post(routes::register_slave))
        .route("/api/v1/slaves/:id/poll", post(routes::poll_slave))
        .route("/api/v1/slaves/:id", delete(routes::unregister_slave))
        .route("/api/v1/executions", get(routes::list_executions).post(routes::start_execution))
        .route("/api/v1/executions/:id", get(routes::get_execution))
        .route("/api/v1/executions/:id/pause", post(routes::pause_execution))
        .route("/api/v1/executions/:id/resume", post(routes::resume_execution))
        .route("/api/v1/executions/:id/abort", post(routes::abort_execution))
        .route("/api/v1/executions/:id/scale", post(routes::scale_execution))
        .route("/ws", get(ws::handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .expect("failed to bind master listener");
    info!(bind_address = %config.bind_address, "master listening");
    axum::serve(listener, app).await.expect("server error");
}
