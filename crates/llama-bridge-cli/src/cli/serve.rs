use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context as _;
use llama_bridge::ModelManager;
use tracing::info;

use crate::cli::{GlobalArgs, ServeArgs};
use crate::config::AppConfig;
use crate::routes;
use crate::state::AppState;

pub async fn execute(global: GlobalArgs, config: &Path, args: ServeArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_from(config)?;
    let model_path = args
        .model
        .or_else(|| cfg.model.clone())
        .context("no model given and none set in the config (`config set model <path>`)")?;

    let backend = global.open_backend()?;

    //  Model
    let model = ModelManager::new(&backend)
        .load(&model_path, &cfg.model_params())
        .with_context(|| format!("loading {}", model_path.display()))?;

    //  Shared state
    let state = AppState::new(backend.clone(), model)?;
    let app = routes::app(state);

    let host = args.host.unwrap_or(cfg.host);
    let port = args.port.unwrap_or(cfg.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, model = %model_path.display(), "Starting tokenization service");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    backend.cleanup();
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, shutting down");
    }
}
