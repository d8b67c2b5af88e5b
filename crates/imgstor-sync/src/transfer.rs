//! One replication transfer between this node and a compute node.
//!
//! Transfers are incremental whenever both ends share a snapshot: a sending
//! transfer starts from the newest snapshot present on both hosts, a
//! receiving transfer from the newest local one (the compute node's copy
//! was built from it). Everything here blocks; callers run it on a worker.

use imgstor_probe::zfs::{self, Zfs};
use imgstor_probe::{CommandRunner, ExecutionError, Invocation};
use imgstor_store::{Direction, ReplicationJob};
use tracing::{debug, info};

use crate::config::SyncConfig;

/// Everything needed to run one transfer without touching shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Volume being replicated.
    pub volume: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Host name the remote commands go to.
    pub host: String,
    /// Local user whose ssh identity is used.
    pub run_as: Option<String>,
    /// Local pool.
    pub pool: String,
    /// Pool on the compute node.
    pub remote_pool: String,
    /// Name of the snapshot taken for this transfer.
    pub snapshot: String,
}

impl Transfer {
    /// Plans the transfer for `job`, naming its snapshot `snapshot`.
    pub fn new(config: &SyncConfig, job: &ReplicationJob, snapshot: impl Into<String>) -> Self {
        Self {
            volume: job.volume.clone(),
            direction: job.direction,
            host: config.transfer_host(&job.remote_host),
            run_as: config.remote_user.clone(),
            pool: config.pool.clone(),
            remote_pool: config.remote_pool.clone(),
            snapshot: snapshot.into(),
        }
    }

    fn local_dataset(&self) -> String {
        zfs::dataset(&self.pool, &self.volume)
    }

    fn remote_dataset(&self) -> String {
        zfs::dataset(&self.remote_pool, &self.volume)
    }

    fn remote(&self, command: imgstor_probe::Command) -> Invocation {
        Invocation::remote(self.host.clone(), self.run_as.clone(), command)
    }

    /// Runs the transfer to completion.
    pub fn execute(&self, runner: &dyn CommandRunner) -> Result<(), ExecutionError> {
        info!(
            volume = %self.volume,
            direction = %self.direction,
            host = %self.host,
            snapshot = %self.snapshot,
            "transfer starting"
        );
        match self.direction {
            Direction::Sending => self.send(runner)?,
            Direction::Receiving => self.receive(runner)?,
        }
        info!(volume = %self.volume, direction = %self.direction, "transfer done");
        Ok(())
    }

    fn send(&self, runner: &dyn CommandRunner) -> Result<(), ExecutionError> {
        let local = self.local_dataset();
        let remote = self.remote_dataset();

        let listing = runner.run(&Invocation::local(Zfs::local().list_snapshots()))?;
        let local_snaps = zfs::parse_snapshots(&listing, &local);
        let listing = runner.run(&self.remote(Zfs::remote().list_snapshots()))?;
        let remote_snaps = zfs::parse_snapshots(&listing, &remote);
        let common: Vec<&String> = local_snaps
            .iter()
            .filter(|s| remote_snaps.contains(s))
            .collect();
        let base = zfs::latest_snapshot(&common);
        debug!(volume = %self.volume, base = ?base, "send base");

        runner.run(&Invocation::local(Zfs::local().snapshot(&local, &self.snapshot)))?;
        runner.pipe(
            &Invocation::local(Zfs::local().send(&local, &self.snapshot, base.as_deref())),
            &self.remote(Zfs::remote().receive_force(&remote)),
        )?;
        Ok(())
    }

    fn receive(&self, runner: &dyn CommandRunner) -> Result<(), ExecutionError> {
        let local = self.local_dataset();
        let remote = self.remote_dataset();

        let listing = runner.run(&Invocation::local(Zfs::local().list_snapshots()))?;
        let base = zfs::latest_snapshot(&zfs::parse_snapshots(&listing, &local));
        debug!(volume = %self.volume, base = ?base, "receive base");

        runner.run(&self.remote(Zfs::remote().snapshot(&remote, &self.snapshot)))?;
        runner.pipe(
            &self.remote(Zfs::remote().send(&remote, &self.snapshot, base.as_deref())),
            &Invocation::local(Zfs::local().receive_force(&local)),
        )?;
        runner.run(&self.remote(Zfs::remote().destroy_recursive(&remote)))?;
        Ok(())
    }
}
