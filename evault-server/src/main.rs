//! # EchoVault Server
//!
//! Redis-compatible TCP server over the persistent in-memory engine.
//!
//! ## Startup Order
//!
//! 1. Parse flags, then restore the snapshot and replay the append log.
//! 2. Start the periodic snapshot worker and bind the listener.
//! 3. On a replica, open the link to the primary.
//!
//! Ctrl-C stops accepting, stops the worker and writes a final snapshot.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use evault_engine::Engine;
use evault_server::config::{Config, Role};
use evault_server::server::{self, ServerState};
use evault_server::replica;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let role = config.role().context("invalid --replicaof")?;
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("failed to create data directory {}", config.dir.display()))?;

    let engine = Arc::new(
        Engine::open(config.engine_config()).context("failed to restore persisted state")?,
    );
    let worker = config
        .save_interval()
        .map(|interval| engine.start_snapshot_worker(interval))
        .transpose()
        .context("failed to start snapshot worker")?;

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %listener.local_addr()?,
        role = role.name(),
        keys = engine.store().len(),
        "EchoVault listening"
    );

    if let Role::Replica(upstream) = &role {
        replica::spawn(upstream.clone(), Arc::clone(&engine));
    }

    let state = Arc::new(ServerState::new(Arc::clone(&engine), role));
    server::run(listener, state, shutdown_signal()).await?;

    info!("shutting down");
    if let Some(worker) = worker {
        worker.stop();
    }
    match engine.save() {
        Ok(stats) => info!(entries = stats.entries, bytes = stats.bytes, "final snapshot saved"),
        Err(err) => error!(error = %err, "final snapshot failed"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
