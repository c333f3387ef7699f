use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sbx_core::spawn_sweeper;
use sbx_workspaces::WorkspaceStore;

use sbx_server::config::ServerConfig;
use sbx_server::http;
use sbx_server::rpc::RpcServer;
use sbx_server::state::AppState;

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(2);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let store = Arc::new(
        WorkspaceStore::open(config.store_layout()).context("open workspace store")?,
    );
    let state = AppState::new(&config, store);

    let sweeper = spawn_sweeper(
        state.registry.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );

    let rpc = RpcServer::bind(config.rpc_addr, state.clone())
        .await
        .context("bind RPC listener")?;
    let rpc_task = tokio::spawn(rpc.run());

    let http_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .context("bind HTTP listener")?;
    info!(addr = %http_listener.local_addr()?, "HTTP listening");
    let app = http::router(state.clone());

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    tokio::select! {
        result = async { axum::serve(http_listener, app).await } => {
            result.context("HTTP server failed")?;
        }
        result = rpc_task => {
            result.context("RPC task panicked")?.context("RPC server failed")?;
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    sweeper.abort();
    state.registry.shutdown().await;
    info!("all sessions reclaimed, bye");
    Ok(())
}
