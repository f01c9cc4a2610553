//! chatseq-server binary entry point.
//!
//! Usage:
//! ```bash
//! chatseq-server --config chatseq-server.toml
//! RUST_LOG=chatseq_server=debug chatseq-server
//! ```

use anyhow::Context;
use chatseq_server::broker::MemoryBroker;
use chatseq_server::storage::SqliteStore;
use chatseq_server::{http, sweeper, ChatServer, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = get_config_path();
    let config = load_config(&config_path)?;

    http::health::init_start_time();

    let store = SqliteStore::new(&config.storage.database)
        .await
        .with_context(|| format!("failed to open database {}", config.storage.database.display()))?;
    let broker = Arc::new(MemoryBroker::new(&config.broker));
    let sweeper_config = config.sweeper.clone();
    let bind_address = config.server.bind_address.clone();

    let server = Arc::new(ChatServer::new(config, Arc::new(store), broker.clone()));
    let _sweeper = sweeper::spawn_sweeper(
        server.broker_arc(),
        server.rate_limits().clone(),
        sweeper_config,
    );

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(addr = %bind_address, version = env!("CARGO_PKG_VERSION"), "chatseq-server listening");

    axum::serve(listener, http::build_router(server))
        .with_graceful_shutdown(shutdown_signal(broker))
        .await?;
    tracing::info!("chatseq-server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. Appends still in flight commit but publish nothing.
async fn shutdown_signal(broker: Arc<MemoryBroker>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
    broker.close();
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("chatseq-server.toml"))
}

/// A missing file means defaults; a broken one is fatal.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        return Ok(Config::default());
    }
    let config = Config::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    tracing::info!(path = %path.display(), "configuration loaded");
    Ok(config)
}
