//! Compute-node daemon configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the mapping/sync controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Name this node receives messages under and signs replies with.
    pub node_name: String,
    /// Job store file.
    pub store_path: PathBuf,
    /// Whether this host buffers writes in a local overlay and syncs volumes.
    pub sync_enabled: bool,
    /// Local pool holding the synced copies and temp volumes.
    pub pool: Option<String>,
    /// Upper bound for the temp write-buffer volume, in GiB.
    pub temp_size_gb: u64,
    /// Period of the merge-back poller.
    pub sync_check_interval_secs: u64,
    /// Number of block-device lookups after an iSCSI login.
    pub attach_attempts: u32,
    /// Delay between those lookups.
    pub attach_retry_ms: u64,
    /// Pause between creating the temp volume and building the overlay.
    pub settle_delay_ms: u64,
    /// Interval of the open-count poll before an overlay is removed.
    pub busy_poll_ms: u64,
    /// Number of open-count polls before giving up with a busy error.
    pub busy_poll_attempts: u32,
    /// Address the TCP bus listens on.
    pub listen_addr: String,
    /// Routing key to `host:port` of every peer this node talks to.
    pub peers: HashMap<String, String>,
    /// Connect timeout towards peers.
    pub connect_timeout_ms: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            node_name: String::from("localhost"),
            store_path: PathBuf::from("/var/lib/imgstor/vm.store"),
            sync_enabled: false,
            pool: None,
            temp_size_gb: 35,
            sync_check_interval_secs: 10,
            attach_attempts: 4,
            attach_retry_ms: 1000,
            settle_delay_ms: 2000,
            busy_poll_ms: 100,
            busy_poll_attempts: 3000,
            listen_addr: String::from("0.0.0.0:7810"),
            peers: HashMap::new(),
            connect_timeout_ms: 5000,
        }
    }
}

impl VmConfig {
    /// Loads a TOML or JSON file, chosen by extension, and validates it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: VmConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_enabled && self.pool.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("sync_enabled requires a pool");
        }
        if self.attach_attempts == 0 {
            anyhow::bail!("attach_attempts must be at least 1");
        }
        if self.sync_check_interval_secs == 0 {
            anyhow::bail!("sync_check_interval_secs must be positive");
        }
        Ok(())
    }

    /// Pool name; empty when sync is disabled.
    pub fn pool(&self) -> &str {
        self.pool.as_deref().unwrap_or_default()
    }

    /// Merge-back poll period.
    pub fn sync_check_interval(&self) -> Duration {
        Duration::from_secs(self.sync_check_interval_secs)
    }

    /// Delay between block-device lookups.
    pub fn attach_retry(&self) -> Duration {
        Duration::from_millis(self.attach_retry_ms)
    }

    /// Pause before building the overlay.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Open-count poll interval.
    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }

    /// Peer connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
