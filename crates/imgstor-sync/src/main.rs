#![warn(missing_docs)]

//! `imgstor-sync` daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use imgstor_probe::HostRunner;
use imgstor_proto::{tcp, TcpBus};
use imgstor_store::JobStore;
use imgstor_sync::{daemon, Coordinator, StaticInventory, SyncConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "imgstor-sync")]
#[command(about = "imgstor storage-node replication daemon", long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "IMGSTOR_SYNC_CONFIG", default_value = "/etc/imgstor/sync.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        SyncConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        SyncConfig::default()
    };
    tracing::info!(
        node = %config.node_name,
        pool = %config.pool,
        sync_hosts = config.sync_hosts.len(),
        "imgstor-sync starting"
    );

    if let Some(dir) = config.store_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = Arc::new(JobStore::open(&config.store_path)?);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let (tx, rx) = mpsc::unbounded_channel();
    let server = tokio::spawn(tcp::serve(listener, config.node_name.clone(), tx));

    let bus = Arc::new(TcpBus::new(config.peers.clone(), config.connect_timeout()));
    let inventory = Arc::new(StaticInventory::new(config.sync_hosts.clone()));
    let mut coordinator =
        Coordinator::new(config, store, Arc::new(HostRunner::new()), bus, inventory);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };
    daemon::run(&mut coordinator, rx, shutdown).await;

    server.abort();
    tracing::info!("imgstor-sync stopped");
    Ok(())
}
