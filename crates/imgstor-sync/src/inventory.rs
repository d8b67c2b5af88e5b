//! Host attributes known to the storage node.

use std::collections::BTreeSet;

/// Answers questions about compute nodes.
pub trait HostAttributes: Send + Sync {
    /// True if `host` buffers writes locally and takes replicated copies.
    fn is_sync_host(&self, host: &str) -> bool;
}

/// Inventory read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    sync_hosts: BTreeSet<String>,
}

impl StaticInventory {
    /// Inventory where exactly `hosts` are sync-enabled.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sync_hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostAttributes for StaticInventory {
    fn is_sync_host(&self, host: &str) -> bool {
        self.sync_hosts.contains(host)
    }
}
