//! Storage-node daemon configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the replication coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name this node receives messages under; used as `reply_to`.
    pub node_name: String,
    /// Job store file.
    pub store_path: PathBuf,
    /// Local pool holding the exported volumes.
    pub pool: String,
    /// Pool on the compute nodes receiving the copies.
    pub remote_pool: String,
    /// Local user whose ssh identity reaches the compute nodes.
    pub remote_user: Option<String>,
    /// Domain appended to compute-node names for transfers, e.g. a
    /// dedicated storage network.
    pub net_suffix: Option<String>,
    /// Compute nodes with sync enabled.
    pub sync_hosts: Vec<String>,
    /// Period of the replication poller.
    pub poll_interval_secs: u64,
    /// Address the TCP bus listens on.
    pub listen_addr: String,
    /// Routing key to `host:port` of every peer this node talks to.
    pub peers: HashMap<String, String>,
    /// Connect timeout towards peers.
    pub connect_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_name: String::from("localhost"),
            store_path: PathBuf::from("/var/lib/imgstor/sync.store"),
            pool: String::from("tank"),
            remote_pool: String::from("tank"),
            remote_user: Some(String::from("zfs")),
            net_suffix: None,
            sync_hosts: Vec::new(),
            poll_interval_secs: 10,
            listen_addr: String::from("0.0.0.0:7811"),
            peers: HashMap::new(),
            connect_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    /// Loads a TOML or JSON file, chosen by extension, and validates it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the coordinator cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.is_empty() || self.remote_pool.is_empty() {
            anyhow::bail!("pool and remote_pool must be set");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be positive");
        }
        Ok(())
    }

    /// Host name transfers use to reach `host`.
    pub fn transfer_host(&self, host: &str) -> String {
        match self.net_suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}.{}", host, suffix),
            None => host.to_string(),
        }
    }

    /// Replication poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Peer connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
