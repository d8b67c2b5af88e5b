//! Device Probe: runs the listing tools and turns their output into facts.
//!
//! Lookups whose absence the callers treat as "not there yet" (sessions,
//! overlays, open counts, exported targets) come back empty when the tool
//! fails; lookups a caller cannot proceed without return the error.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::dm::{self, OverlayStatus};
use crate::exec::{CommandRunner, ExecutionError, Invocation};
use crate::tgt::{self, TgtTarget};
use crate::zfs::{self, Zfs};
use crate::{blockdev, iscsi};

/// Read-only queries against the local host.
#[derive(Clone)]
pub struct DeviceProbe {
    runner: Arc<dyn CommandRunner>,
}

impl DeviceProbe {
    /// Creates a probe running its queries through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Active iSCSI sessions: target → local disk name (`sdb`).
    pub fn block_devices(&self) -> BTreeMap<String, String> {
        match self.runner.run(&Invocation::local(iscsi::session_list())) {
            Ok(lines) => iscsi::parse_sessions(&lines),
            Err(e) => {
                debug!(error = %e, "no iSCSI sessions");
                BTreeMap::new()
            }
        }
    }

    /// Local disk name for `target`, if a session exposes one.
    pub fn device_for_target(&self, target: &str) -> Option<String> {
        self.block_devices().remove(target)
    }

    /// Status of one overlay device.
    pub fn overlay_status(&self, name: &str) -> Result<OverlayStatus, ExecutionError> {
        let lines = self.runner.run(&Invocation::local(dm::status(name)))?;
        dm::parse_status(&lines)
    }

    /// Status of every device-mapper device with a snapshot or linear table.
    pub fn overlay_statuses(&self) -> Vec<(String, OverlayStatus)> {
        match self.runner.run(&Invocation::local(dm::status_all())) {
            Ok(lines) => dm::parse_status_all(&lines),
            Err(e) => {
                debug!(error = %e, "dmsetup status failed");
                Vec::new()
            }
        }
    }

    /// Number of openers of a device-mapper device; `None` if it does not exist.
    pub fn open_count(&self, name: &str) -> Option<u32> {
        match self.runner.run(&Invocation::local(dm::open_count(name))) {
            Ok(lines) => dm::parse_open_count(&lines),
            Err(e) => {
                debug!(device = name, error = %e, "dmsetup info failed");
                None
            }
        }
    }

    /// Size of a block device in sectors.
    pub fn device_size(&self, device: &str) -> Result<u64, ExecutionError> {
        let lines = self.runner.run(&Invocation::local(blockdev::get_size(device)))?;
        blockdev::parse_size(&lines)
    }

    /// Snapshot names of a local dataset, in listing order.
    pub fn snapshots(&self, dataset: &str) -> Result<Vec<String>, ExecutionError> {
        let lines = self.runner.run(&Invocation::local(Zfs::local().list_snapshots()))?;
        Ok(zfs::parse_snapshots(&lines, dataset))
    }

    /// Targets exported by the local `tgtd`.
    pub fn exported_targets(&self) -> Vec<TgtTarget> {
        match self.runner.run(&Invocation::local(tgt::show_targets())) {
            Ok(lines) => tgt::parse_targets(&lines),
            Err(e) => {
                debug!(error = %e, "tgtadm show failed");
                Vec::new()
            }
        }
    }
}
