use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use coderun::{
    api::routes, config::EngineConfig, orchestrator::Orchestrator, sandbox::SandboxFactory,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("failed to build engine config")?;
    init_tracing(&config);

    let sandbox = SandboxFactory::from_config(&config).context("sandbox backend init failed")?;
    let orchestrator = Arc::new(Orchestrator::start(&config, sandbox));

    let app: Router = routes(&config, orchestrator);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, log_dir = %config.log_dir.display(), "code runner ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("code runner server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
