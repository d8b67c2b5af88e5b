//! Records kept by the job store.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in microseconds since the epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Single-holder lock on a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Locked volume.
    pub volume: String,
    /// Node or queue that requested the operation.
    pub requester: String,
    /// When the lock was taken (microseconds since epoch).
    pub acquired_at_us: u64,
}

/// Pending merge-back of a local overlay into its backing volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Volume being merged.
    pub volume: String,
    /// iSCSI target the overlay currently reads through.
    pub target: String,
    /// Device size as reported by `blockdev --getsize`, passed through verbatim.
    pub size: u64,
    /// Where the completion is published.
    pub reply_to: String,
    /// Correlation id echoed on the completion.
    pub correlation_id: Option<String>,
    /// Set once the overlay has been reloaded into `snapshot-merge`.
    pub started: bool,
    /// Enqueue time (microseconds since epoch).
    pub enqueued_at_us: u64,
    /// Store-assigned arrival order; queues are served by ascending `seq`.
    pub seq: u64,
}

impl SyncJob {
    /// Creates an unstarted job stamped with the current time.
    pub fn new(
        volume: impl Into<String>,
        target: impl Into<String>,
        size: u64,
        reply_to: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            size,
            reply_to: reply_to.into(),
            correlation_id,
            started: false,
            enqueued_at_us: now_us(),
            seq: 0,
        }
    }

    pub(crate) fn queue_key(&self) -> u64 {
        self.seq
    }
}

/// Direction of a cross-node transfer, seen from the storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ship the local volume to the compute node.
    Sending,
    /// Pull the volume back from the compute node.
    Receiving,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sending => write!(f, "sending"),
            Direction::Receiving => write!(f, "receiving"),
        }
    }
}

/// Entry of the storage-node replication queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    /// Volume to replicate.
    pub volume: String,
    /// Compute node on the other end of the transfer.
    pub remote_host: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Enqueue time (microseconds since epoch).
    pub enqueued_at_us: u64,
    /// Store-assigned arrival order; queues are served by ascending `seq`.
    pub seq: u64,
}

impl ReplicationJob {
    /// Creates a job stamped with the current time.
    pub fn new(
        volume: impl Into<String>,
        remote_host: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            volume: volume.into(),
            remote_host: remote_host.into(),
            direction,
            enqueued_at_us: now_us(),
            seq: 0,
        }
    }

    pub(crate) fn queue_key(&self) -> u64 {
        self.seq
    }
}
