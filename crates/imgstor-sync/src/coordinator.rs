//! Replication Coordinator.
//!
//! Turns mapping notifications from sync-enabled compute nodes into queued
//! transfers, runs the queue one transfer at a time and detaches the export
//! once the compute node reports its copy merged.

use std::sync::Arc;

use imgstor_probe::zfs;
use imgstor_probe::{tgt, CommandRunner, DeviceProbe, Invocation, TgtTarget};
use imgstor_proto::{
    Action, Delivery, Failure, MessageBus, Payload, Properties, ProtoError, Status,
    ACTION_UNSUPPORTED,
};
use imgstor_store::{Direction, JobStore, ReplicationJob};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::inventory::HostAttributes;
use crate::transfer::Transfer;
use crate::worker::TransferWorker;

/// Result of one poller tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing queued.
    Idle,
    /// The oldest job's transfer was handed to the worker.
    Started {
        /// Volume being transferred.
        volume: String,
    },
    /// The running transfer has not finished yet.
    InFlight {
        /// Volume being transferred.
        volume: String,
    },
    /// A transfer finished and its job was removed.
    Completed {
        /// Volume transferred.
        volume: String,
        /// Whether the transfer succeeded.
        success: bool,
    },
}

/// Storage-node coordinator state.
pub struct Coordinator {
    config: SyncConfig,
    store: Arc<JobStore>,
    runner: Arc<dyn CommandRunner>,
    probe: DeviceProbe,
    bus: Arc<dyn MessageBus>,
    inventory: Arc<dyn HostAttributes>,
    worker: TransferWorker,
}

impl Coordinator {
    /// Creates a coordinator over an opened store.
    pub fn new(
        config: SyncConfig,
        store: Arc<JobStore>,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn MessageBus>,
        inventory: Arc<dyn HostAttributes>,
    ) -> Self {
        let probe = DeviceProbe::new(runner.clone());
        Self {
            config,
            store,
            runner,
            probe,
            bus,
            inventory,
            worker: TransferWorker::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Job store.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn volume_for_target(&self, target: &str) -> Result<String, SyncError> {
        self.probe
            .exported_targets()
            .into_iter()
            .find(|t| t.name == target)
            .and_then(|t| t.volume_in(&self.config.pool))
            .ok_or_else(|| SyncError::UnknownTarget {
                target: target.to_string(),
            })
    }

    fn target_for_volume(&self, volume: &str) -> Option<TgtTarget> {
        self.probe
            .exported_targets()
            .into_iter()
            .find(|t| t.volume_in(&self.config.pool).as_deref() == Some(volume))
    }

    fn accepts(&self, status: Status, requester: Option<&str>) -> Option<String> {
        if status != Status::Success {
            return None;
        }
        let requester = requester?;
        if !self.inventory.is_sync_host(requester) {
            debug!(host = requester, "not a sync host");
            return None;
        }
        Some(requester.to_string())
    }

    /// Queues shipping the volume behind `target` to `requester` once it
    /// has attached it. Returns the queued job, or `None` if the
    /// notification needs no transfer.
    pub fn on_mapped(
        &self,
        target: &str,
        status: Status,
        requester: Option<&str>,
    ) -> Result<Option<ReplicationJob>, SyncError> {
        let Some(host) = self.accepts(status, requester) else {
            return Ok(None);
        };
        let volume = self.volume_for_target(target)?;
        let job = self
            .store
            .enqueue_replication(ReplicationJob::new(volume, host, Direction::Sending))?;
        info!(volume = %job.volume, host = %job.remote_host, "queued sending transfer");
        Ok(Some(job))
    }

    /// Queues pulling `zvol` back from `requester` once it has detached it.
    pub fn on_unmapped(
        &self,
        zvol: Option<&str>,
        status: Status,
        requester: Option<&str>,
    ) -> Result<Option<ReplicationJob>, SyncError> {
        let Some(host) = self.accepts(status, requester) else {
            return Ok(None);
        };
        let Some(zvol) = zvol else {
            warn!(host = %host, "unmap notification without zvol");
            return Ok(None);
        };
        let job = self
            .store
            .enqueue_replication(ReplicationJob::new(zvol, host, Direction::Receiving))?;
        info!(volume = %job.volume, host = %job.remote_host, "queued receiving transfer");
        Ok(Some(job))
    }

    /// The compute node finished merging `zvol` into its local copy: retire
    /// the export and free the volume. On an error status only the lock is
    /// released.
    pub fn on_synced(&self, zvol: &str, status: Status) -> Result<(), SyncError> {
        if status == Status::Success {
            match self.target_for_volume(zvol) {
                Some(target) => {
                    self.runner
                        .run(&Invocation::local(tgt::delete_target(target.tid)))?;
                    info!(volume = zvol, iqn = %target.name, tid = target.tid, "target removed");
                }
                None => warn!(volume = zvol, "no exported target left to remove"),
            }
        }
        if self.store.release(zvol)? {
            debug!(volume = zvol, "lock released");
        }
        Ok(())
    }

    /// One poller tick: start the oldest transfer, or collect the running
    /// one once it has finished.
    pub async fn poll(&mut self) -> PollOutcome {
        if let Some(volume) = self.worker.current().map(str::to_string) {
            return match self.worker.take_finished().await {
                None => PollOutcome::InFlight { volume },
                Some((volume, result)) => self.finish(volume, result).await,
            };
        }

        let Some(job) = self.store.peek_oldest_replication() else {
            return PollOutcome::Idle;
        };
        let transfer = Transfer::new(&self.config, &job, zfs::snapshot_name_now());
        let runner = self.runner.clone();
        self.worker.start(job.volume.clone(), move || {
            transfer.execute(runner.as_ref()).map_err(SyncError::from)
        });
        PollOutcome::Started { volume: job.volume }
    }

    async fn finish(&self, volume: String, result: Result<(), SyncError>) -> PollOutcome {
        let job = self
            .store
            .replication_jobs()
            .into_iter()
            .find(|j| j.volume == volume);
        let success = result.is_ok();

        match (result, job) {
            (Ok(()), Some(job)) if job.direction == Direction::Sending => {
                if let Err(e) = self.notify_sent(&job).await {
                    error!(volume = %volume, error = %e, "could not request sync");
                }
            }
            (Ok(()), _) => {}
            (Err(e), _) => error!(volume = %volume, error = %e, "transfer failed"),
        }

        if let Err(e) = self.store.delete_replication(&volume) {
            error!(volume = %volume, error = %e, "could not remove replication job");
        }
        PollOutcome::Completed { volume, success }
    }

    async fn notify_sent(&self, job: &ReplicationJob) -> Result<(), SyncError> {
        let target = self
            .target_for_volume(&job.volume)
            .ok_or_else(|| SyncError::TargetNotBound {
                volume: job.volume.clone(),
            })?;
        let request = Payload::from(Action::SyncZvol {
            zvol: job.volume.clone(),
            target: target.name,
        });
        let props = Properties::new().reply_to(self.config.node_name.clone());
        self.bus.publish(&job.remote_host, &request, props).await?;
        info!(volume = %job.volume, host = %job.remote_host, "sync requested");
        Ok(())
    }

    /// Handles one inbound message.
    ///
    /// Notifications are never answered. Other recognized actions get an
    /// `action_unsupported` reply; undecodable messages are dropped.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<(), ProtoError> {
        let requester = delivery.props.reply_to.as_deref();
        let action = match Action::from_json(&delivery.body) {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, from = ?requester, "dropping malformed message");
                return Ok(());
            }
        };
        debug!(action = action.name(), from = ?requester, "received");

        match action {
            Action::ZvolMapped {
                target,
                status,
                error,
                ..
            } => {
                if let Some(error) = error {
                    info!(iqn = %target, error = %error, "compute node failed to map");
                }
                log_enqueue(&target, self.on_mapped(&target, status, requester));
            }
            Action::ZvolUnmapped {
                target,
                zvol,
                status,
                error,
            } => {
                if let Some(error) = error {
                    info!(iqn = ?target, error = %error, "compute node failed to unmap");
                }
                let name = zvol.clone().or(target).unwrap_or_default();
                log_enqueue(&name, self.on_unmapped(zvol.as_deref(), status, requester));
            }
            Action::ZvolSynced { zvol, status, error } => {
                if let Some(error) = error {
                    warn!(volume = %zvol, error = %error, "compute node failed to sync");
                }
                if let Err(e) = self.on_synced(&zvol, status) {
                    error!(volume = %zvol, error = %e, "could not retire export");
                }
            }
            other => {
                debug!(action = other.name(), "unsupported action");
                if let Some(to) = requester {
                    let props = Properties::new()
                        .reply_to(self.config.node_name.clone())
                        .correlation_id(delivery.props.message_id.clone());
                    let reply = Payload::from(Failure::new(ACTION_UNSUPPORTED));
                    self.bus.publish(to, &reply, props).await?;
                }
            }
        }
        Ok(())
    }
}

fn log_enqueue(name: &str, outcome: Result<Option<ReplicationJob>, SyncError>) {
    match outcome {
        Ok(Some(job)) => debug!(volume = %job.volume, seq = job.seq, "enqueued"),
        Ok(None) => debug!(volume = %name, "notification ignored"),
        Err(e) if e.is_reportable() => warn!(volume = %name, error = %e, "transfer refused"),
        Err(e) => error!(volume = %name, error = ?e, "could not queue transfer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgstor_probe::fakes::FakeRunner;
    use imgstor_proto::LocalBus;

    use crate::inventory::StaticInventory;

    const TARGETS: &str = "\
Target 1: iqn.2001-04.com.nas-0-1-vol1
    LUN information:
        LUN: 1
            Backing store path: /dev/tank/vol1
Target 3: iqn.2001-04.com.nas-0-1-vol2
    LUN information:
        LUN: 1
            Backing store path: /dev/tank/vol2";

    fn coordinator(runner: Arc<FakeRunner>) -> Coordinator {
        Coordinator::new(
            SyncConfig {
                node_name: "nas-0-1".into(),
                ..SyncConfig::default()
            },
            Arc::new(JobStore::in_memory()),
            runner,
            Arc::new(LocalBus::new()),
            Arc::new(StaticInventory::new(["compute-0-1"])),
        )
    }

    fn tgtd() -> Arc<FakeRunner> {
        Arc::new(FakeRunner::new(|argv| match argv[0].as_str() {
            "tgtadm" if argv[1] == "--op" => Ok(FakeRunner::lines(TARGETS)),
            _ => Ok(Vec::new()),
        }))
    }

    #[test]
    fn test_volume_resolved_from_backing_store() {
        let c = coordinator(tgtd());
        assert_eq!(c.volume_for_target("iqn.2001-04.com.nas-0-1-vol2").unwrap(), "vol2");
        assert!(matches!(
            c.volume_for_target("iqn.2001-04.com.nas-0-1-vol9"),
            Err(SyncError::UnknownTarget { .. })
        ));
        assert_eq!(c.target_for_volume("vol1").map(|t| t.tid), Some(1));
    }

    #[test]
    fn test_filters() {
        let c = coordinator(tgtd());
        let target = "iqn.2001-04.com.nas-0-1-vol1";
        assert!(c.on_mapped(target, Status::Error, Some("compute-0-1")).unwrap().is_none());
        assert!(c.on_mapped(target, Status::Success, Some("compute-0-2")).unwrap().is_none());
        assert!(c.on_mapped(target, Status::Success, None).unwrap().is_none());
        assert!(c.on_unmapped(None, Status::Success, Some("compute-0-1")).unwrap().is_none());
        assert!(!c.store().has_replication_jobs());
    }

    #[tokio::test]
    async fn test_poll_idle_runs_nothing() {
        let runner = tgtd();
        let mut c = coordinator(runner.clone());
        assert_eq!(c.poll().await, PollOutcome::Idle);
        assert_eq!(runner.call_count(), 0);
    }
}
