//! Mapping/Sync Controller.
//!
//! Attaches iSCSI targets, builds the write-buffering overlay on sync hosts,
//! tears both down again, and merges overlays back into their local copies.
//! Every state-changing operation holds the volume lock from the job store
//! for its whole duration.

use std::collections::BTreeMap;
use std::sync::Arc;

use imgstor_probe::dm::{self, OverlayMode, Table};
use imgstor_probe::exec::{Command, CommandRunner, ExecutionError, Invocation};
use imgstor_probe::zfs::{self, Zfs};
use imgstor_probe::{iscsi, DeviceProbe};
use imgstor_proto::{
    Action, Delivery, DevListBody, Failure, MessageBus, NodeType, OverlayEntry, Payload,
    Properties, ProtoError, Status, TargetDevice, ACTION_UNSUPPORTED,
};
use imgstor_store::{JobStore, SyncJob};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::VmConfig;
use crate::error::VmError;

/// Lock requester used when a request carries no reply address.
const ANONYMOUS: &str = "anonymous";

/// Outcome of one merge-back pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPass {
    /// No job was queued.
    Idle,
    /// The oldest job is still merging.
    Merging {
        /// Volume being merged.
        volume: String,
    },
    /// The oldest job finished and was reported.
    Synced {
        /// Volume now running on its local copy.
        volume: String,
    },
    /// The oldest job failed and was dropped.
    Failed {
        /// Volume whose sync failed.
        volume: String,
        /// Reason reported to the requester.
        error: String,
    },
}

/// Compute-node controller state.
pub struct VmController {
    config: VmConfig,
    store: Arc<JobStore>,
    runner: Arc<dyn CommandRunner>,
    probe: DeviceProbe,
    bus: Arc<dyn MessageBus>,
}

impl VmController {
    /// Creates a controller over an opened store.
    pub fn new(
        config: VmConfig,
        store: Arc<JobStore>,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let probe = DeviceProbe::new(runner.clone());
        Self {
            config,
            store,
            runner,
            probe,
            bus,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Backing job store.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    fn run(&self, command: Command) -> Result<Vec<String>, ExecutionError> {
        self.runner.run(&Invocation::local(command))
    }

    fn release(&self, volume: &str) {
        if let Err(e) = self.store.release(volume) {
            error!(volume, error = %e, "failed to release volume lock");
        }
    }

    /// Startup recovery: drops locks left by interrupted operations and
    /// returns the number of sync jobs that are still pending.
    pub fn recover(&self) -> Result<usize, VmError> {
        for lock in self.store.release_orphaned_locks()? {
            warn!(
                volume = %lock.volume,
                requester = %lock.requester,
                "released lock left by an interrupted operation"
            );
        }
        let pending = self.store.sync_jobs();
        for job in &pending {
            info!(volume = %job.volume, started = job.started, "resuming sync job");
        }
        Ok(pending.len())
    }

    // ---- map ----

    /// Attaches `target` from `nas` and returns the device the VM should use.
    pub async fn map_zvol(
        &self,
        target: &str,
        nas: &str,
        size: u64,
        zvol: Option<&str>,
        requester: &str,
    ) -> Result<String, VmError> {
        let zvol = zvol.filter(|z| !z.is_empty());
        let key = zvol.unwrap_or(target);
        self.store.acquire(key, requester)?;
        let result = self.attach(target, nas, size, zvol).await;
        self.release(key);
        result
    }

    async fn attach(
        &self,
        target: &str,
        nas: &str,
        size: u64,
        zvol: Option<&str>,
    ) -> Result<String, VmError> {
        if self.config.sync_enabled {
            if zvol.is_none() {
                return Err(VmError::invalid("zvol name is required on a sync host"));
            }
            if size <= 1 {
                return Err(VmError::invalid(format!(
                    "size {}gb leaves no room for a temp volume",
                    size
                )));
            }
        }

        self.connect(target, nas)?;
        let device = self.wait_for_device(target).await?;
        let bdev = format!("/dev/{}", device);

        let zvol = match (self.config.sync_enabled, zvol) {
            (true, Some(zvol)) => zvol,
            _ => {
                info!(target, bdev = %bdev, "mapped");
                return Ok(bdev);
            }
        };

        let pool = self.config.pool();
        let zfs = Zfs::local();
        let local = zfs::dataset(pool, zvol);
        let temp = zfs::temp_volume(zvol);
        let temp_size = self.config.temp_size_gb.min(size - 1);

        if let Err(e) = self.run(zfs.destroy_recursive(&local)) {
            debug!(dataset = %local, error = %e, "no stale local copy");
        }
        self.run(zfs.create_volume(&local, size))?;
        self.run(zfs.create_volume(&zfs::dataset(pool, &temp), temp_size))?;
        sleep(self.config.settle_delay()).await;

        let table = Table::Snapshot {
            sectors: temp_size * dm::SECTORS_PER_GIB,
            origin: bdev,
            cow: zfs::zvol_device(pool, &temp),
        };
        self.run(dm::create(&dm::overlay_name(zvol), &table))?;

        let overlay = dm::overlay_path(zvol);
        info!(target, zvol, bdev = %overlay, temp_size, "mapped through overlay");
        Ok(overlay)
    }

    fn connect(&self, target: &str, nas: &str) -> Result<(), VmError> {
        let records = self.run(iscsi::discover(nas))?;
        if !iscsi::discovery_has_target(&records, target) {
            return Err(VmError::TargetNotFound {
                target: target.to_string(),
                nas: nas.to_string(),
            });
        }
        self.run(iscsi::login(target, nas))?;
        Ok(())
    }

    /// The kernel may publish the disk some time after login.
    async fn wait_for_device(&self, target: &str) -> Result<String, VmError> {
        let attempts = self.config.attach_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(device) = self.probe.device_for_target(target) {
                return Ok(device);
            }
            if attempt < attempts {
                debug!(target, attempt, "block device not there yet");
                sleep(self.config.attach_retry()).await;
            }
        }
        Err(VmError::DeviceNotFound {
            target: target.to_string(),
        })
    }

    // ---- unmap ----

    /// Removes the overlay (sync host) or logs out of the target.
    pub async fn unmap_zvol(&self, target: &str, zvol: &str, requester: &str) -> Result<(), VmError> {
        self.store.acquire(zvol, requester)?;
        let result = if self.config.sync_enabled {
            self.remove_overlay(zvol).await
        } else {
            self.disconnect(target)
        };
        self.release(zvol);
        result
    }

    async fn remove_overlay(&self, zvol: &str) -> Result<(), VmError> {
        let name = dm::overlay_name(zvol);
        let mut attempts = 0u32;
        loop {
            match self.probe.open_count(&name) {
                None => {
                    debug!(device = %name, "overlay already gone");
                    return Ok(());
                }
                Some(0) => break,
                Some(openers) => {
                    attempts += 1;
                    if attempts >= self.config.busy_poll_attempts {
                        return Err(VmError::DeviceBusy { device: name });
                    }
                    debug!(device = %name, openers, "overlay in use");
                    sleep(self.config.busy_poll()).await;
                }
            }
        }
        self.run(dm::remove(&name))?;
        info!(zvol, "overlay removed");
        Ok(())
    }

    fn disconnect(&self, target: &str) -> Result<(), VmError> {
        if self.probe.device_for_target(target).is_none() {
            debug!(target, "no session to tear down");
            return Ok(());
        }
        self.run(iscsi::logout(target))?;
        info!(target, "logged out");
        Ok(())
    }

    // ---- list ----

    /// Describes the local devices.
    pub fn list_dev(&self) -> Action {
        let sessions = self.probe.block_devices();
        if !self.config.sync_enabled {
            let body = sessions
                .into_iter()
                .map(|(target, device)| TargetDevice { target, device })
                .collect();
            return Action::DevList {
                status: Status::Success,
                node_type: NodeType::Iscsi,
                body: DevListBody::Iscsi(body),
            };
        }

        let mut overlays = BTreeMap::new();
        for (name, status) in self.probe.overlay_statuses() {
            let zvol = match dm::zvol_for_overlay(&name) {
                Some(zvol) => zvol.to_string(),
                None => continue,
            };
            let session = sessions.iter().find(|(target, _)| target.ends_with(&zvol));
            let entry = OverlayEntry {
                dev: name.clone(),
                status: status.mode.to_string(),
                size: status.size_gib(),
                synced: (status.mode != OverlayMode::Linear).then(|| status.detail.clone()),
                target: session.map(|(target, _)| target.clone()),
                bdev: session.map(|(_, device)| device.clone()),
                started: None,
                time: None,
            };
            overlays.insert(zvol, entry);
        }
        for job in self.store.sync_jobs() {
            if let Some(entry) = overlays.get_mut(&job.volume) {
                entry.started = Some(job.started);
                entry.time = Some(job.enqueued_at_us / 1_000_000);
            }
        }

        Action::DevList {
            status: Status::Success,
            node_type: NodeType::Sync,
            body: DevListBody::Sync(overlays),
        }
    }

    // ---- sync ----

    /// Queues the merge-back of `zvol`. The lock taken here is held until
    /// [`Self::run_sync`] finishes the job.
    pub fn sync_zvol(
        &self,
        zvol: &str,
        target: &str,
        reply_to: &str,
        correlation_id: Option<String>,
    ) -> Result<SyncJob, VmError> {
        if !self.config.sync_enabled {
            return Err(VmError::invalid("sync is not enabled on this host"));
        }
        self.store.acquire(zvol, reply_to)?;
        let queued = self.queue_sync(zvol, target, reply_to, correlation_id);
        if queued.is_err() {
            self.release(zvol);
        }
        queued
    }

    fn queue_sync(
        &self,
        zvol: &str,
        target: &str,
        reply_to: &str,
        correlation_id: Option<String>,
    ) -> Result<SyncJob, VmError> {
        let device = self
            .probe
            .device_for_target(target)
            .ok_or_else(|| VmError::DeviceNotFound {
                target: target.to_string(),
            })?;
        let size = self.probe.device_size(&format!("/dev/{}", device))?;
        let job = self
            .store
            .enqueue_sync(SyncJob::new(zvol, target, size, reply_to, correlation_id))?;
        info!(zvol, target, size, "sync queued");
        Ok(job)
    }

    /// Advances the oldest sync job by one step and reports completion or
    /// failure to the job's requester.
    pub async fn run_sync(&self) -> SyncPass {
        let job = match self.store.peek_oldest_sync() {
            Some(job) => job,
            None => return SyncPass::Idle,
        };

        let (pass, reply) = match self.advance(&job) {
            Ok(false) => {
                return SyncPass::Merging {
                    volume: job.volume,
                }
            }
            Ok(true) => {
                info!(zvol = %job.volume, "synced to local copy");
                let reply = Action::ZvolSynced {
                    zvol: job.volume.clone(),
                    status: Status::Success,
                    error: None,
                };
                (SyncPass::Synced { volume: job.volume.clone() }, reply)
            }
            Err(e) => {
                error!(zvol = %job.volume, error = ?e, "sync failed");
                if let Err(e) = self.store.delete_sync(&job.volume) {
                    error!(zvol = %job.volume, error = %e, "failed to drop sync job");
                }
                let reason = e.to_string();
                let reply = Action::ZvolSynced {
                    zvol: job.volume.clone(),
                    status: Status::Error,
                    error: Some(reason.clone()),
                };
                let pass = SyncPass::Failed {
                    volume: job.volume.clone(),
                    error: reason,
                };
                (pass, reply)
            }
        };

        self.release(&job.volume);
        let props = Properties::new()
            .reply_to(self.config.node_name.clone())
            .correlation_id(job.correlation_id.clone());
        if let Err(e) = self.bus.publish(&job.reply_to, &reply.into(), props).await {
            error!(zvol = %job.volume, to = %job.reply_to, error = %e, "failed to report sync");
        }
        pass
    }

    /// Returns true once the overlay runs linear on the local copy.
    fn advance(&self, job: &SyncJob) -> Result<bool, VmError> {
        let pool = self.config.pool();
        let device = dm::overlay_path(&job.volume);
        let origin = zfs::zvol_device(pool, &job.volume);
        let temp = zfs::temp_volume(&job.volume);

        if !job.started {
            debug!(zvol = %job.volume, "starting merge");
            let merge = Table::SnapshotMerge {
                sectors: job.size,
                origin: origin.clone(),
                cow: zfs::zvol_device(pool, &temp),
            };
            self.swap_table(&device, &merge)?;
            self.store.mark_started(&job.volume)?;
        }

        let status = self.probe.overlay_status(&dm::overlay_name(&job.volume))?;
        let progress = status.progress.ok_or_else(|| {
            ExecutionError::parse(
                "dmsetup status",
                format!("no merge progress in {:?}", status.detail),
            )
        })?;
        if !progress.is_complete() {
            debug!(
                zvol = %job.volume,
                remaining = progress.numerator(),
                target = progress.denominator(),
                "merge in progress"
            );
            return Ok(false);
        }

        if !status.mode.can_transition_to(OverlayMode::Linear) {
            return Err(VmError::ModeTransition {
                device: dm::overlay_name(&job.volume),
                from: status.mode,
                to: OverlayMode::Linear,
            });
        }

        self.store.delete_sync(&job.volume)?;
        let linear = Table::Linear {
            sectors: job.size,
            device: origin,
        };
        self.swap_table(&device, &linear)?;
        self.run(Zfs::local().destroy(&zfs::dataset(pool, &temp)))?;
        self.run(iscsi::logout(&job.target))?;
        Ok(true)
    }

    fn swap_table(&self, device: &str, table: &Table) -> Result<(), VmError> {
        self.run(dm::suspend(device))?;
        self.run(dm::reload(device, table))?;
        self.run(dm::resume(device))?;
        debug!(device, mode = %table.mode(), "table reloaded");
        Ok(())
    }

    // ---- messages ----

    /// Decodes one delivery, runs the action and publishes its reply.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<(), ProtoError> {
        let reply_to = delivery.props.reply_to.as_deref();
        let correlation = delivery.props.message_id.clone();
        let requester = reply_to.unwrap_or(ANONYMOUS);

        let action = match Action::from_json(&delivery.body) {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, "malformed message");
                let reply = Failure::new(e.to_string()).into();
                return self.reply(reply_to, reply, correlation).await;
            }
        };
        debug!(action = action.name(), from = requester, "received");

        let reply: Payload = match action {
            Action::MapZvol {
                target,
                nas,
                size,
                zvol,
            } => {
                let outcome = self.map_zvol(&target, &nas, size, zvol.as_deref(), requester).await;
                let reply = match outcome {
                    Ok(bdev) => Action::ZvolMapped {
                        target,
                        bdev: Some(bdev),
                        status: Status::Success,
                        error: None,
                    },
                    Err(e) if e.is_reportable() => {
                        warn!(iqn = %target, error = %e, "map failed");
                        Action::ZvolMapped {
                            target,
                            bdev: None,
                            status: Status::Error,
                            error: Some(e.to_string()),
                        }
                    }
                    Err(e) => {
                        error!(iqn = %target, error = ?e, "unexpected error mapping");
                        Action::ZvolUnmapped {
                            target: Some(target),
                            zvol,
                            status: Status::Error,
                            error: Some(e.to_string()),
                        }
                    }
                };
                reply.into()
            }
            Action::UnmapZvol { target, zvol } => {
                let outcome = self.unmap_zvol(&target, &zvol, requester).await;
                let (status, error) = match outcome {
                    Ok(()) => (Status::Success, None),
                    Err(e) => {
                        if e.is_reportable() {
                            warn!(zvol = %zvol, error = %e, "unmap failed");
                        } else {
                            error!(zvol = %zvol, error = ?e, "unexpected error unmapping");
                        }
                        (Status::Error, Some(e.to_string()))
                    }
                };
                Action::ZvolUnmapped {
                    target: Some(target),
                    zvol: Some(zvol),
                    status,
                    error,
                }
                .into()
            }
            Action::ListDev => self.list_dev().into(),
            Action::SyncZvol { zvol, target } => {
                match self.sync_zvol(&zvol, &target, requester, correlation.clone()) {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        if e.is_reportable() {
                            warn!(zvol = %zvol, error = %e, "sync refused");
                        } else {
                            error!(zvol = %zvol, error = ?e, "unexpected error queueing sync");
                        }
                        Action::ZvolSynced {
                            zvol,
                            status: Status::Error,
                            error: Some(e.to_string()),
                        }
                        .into()
                    }
                }
            }
            other => {
                debug!(action = other.name(), "unsupported action");
                Failure::new(ACTION_UNSUPPORTED).into()
            }
        };
        self.reply(reply_to, reply, correlation).await
    }

    async fn reply(
        &self,
        to: Option<&str>,
        payload: Payload,
        correlation: Option<String>,
    ) -> Result<(), ProtoError> {
        let to = match to {
            Some(to) => to,
            None => {
                warn!("request has no reply address; dropping reply");
                return Ok(());
            }
        };
        let props = Properties::new()
            .reply_to(self.config.node_name.clone())
            .correlation_id(correlation);
        self.bus.publish(to, &payload, props).await
    }
}
