#![warn(missing_docs)]

//! `imgstor-vm` daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use imgstor_probe::HostRunner;
use imgstor_proto::{tcp, TcpBus};
use imgstor_store::JobStore;
use imgstor_vm::{daemon, VmConfig, VmController};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "imgstor-vm")]
#[command(about = "imgstor compute-node mapping and sync daemon", long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "IMGSTOR_VM_CONFIG", default_value = "/etc/imgstor/vm.toml")]
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
        VmConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        VmConfig::default()
    };
    tracing::info!(
        node = %config.node_name,
        sync = config.sync_enabled,
        "imgstor-vm starting"
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
    let controller = VmController::new(config, store, Arc::new(HostRunner::new()), bus);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };
    daemon::run(&controller, rx, shutdown).await?;

    server.abort();
    tracing::info!("imgstor-vm stopped");
    Ok(())
}
