/// Server setup and initialization
///
/// Wires together the module registry, the pipeline engine, run storage and the HTTP
/// routes. Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_module_routes, create_workflow_routes, AppState},
    config::Config,
    pipeline::{registry::ModuleRegistry, storage::RunStorage},
    runtime::engine::PipelineEngine,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`)
///
/// Logs go to stderr so `geoflow run` keeps stdout for the report.
/// Later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Engine with the built-in stage types registered
pub fn build_engine(config: &Config) -> PipelineEngine {
    tracing::info!("📊 Initializing module registry");
    let registry = Arc::new(ModuleRegistry::with_builtin(config.engine.clone()));
    PipelineEngine::new(registry, config.engine.clone())
}

/// Create the main Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    let engine = Arc::new(build_engine(&config));

    tracing::info!("🗄️ Initializing run storage");
    let storage = RunStorage::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open run storage: {}", e))?;

    tracing::info!("📁 Run outputs go under {}", config.engine.output_folder);
    let app_state = AppState {
        engine,
        storage,
        active_runs: Arc::new(RwLock::new(HashMap::new())),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_module_routes())
        .with_state(app_state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing::info!("Starting geoflow server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
