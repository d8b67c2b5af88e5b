//! Coordinator errors.

use imgstor_probe::ExecutionError;
use imgstor_proto::ProtoError;
use imgstor_store::StoreError;
use thiserror::Error;

/// Errors from the replication coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No exported target with this name backs a volume in the pool.
    #[error("no volume exported as {target}")]
    UnknownTarget {
        /// Target IQN.
        target: String,
    },

    /// No exported target is backed by this volume.
    #[error("no target exports zvol {volume}")]
    TargetNotBound {
        /// Volume name.
        volume: String,
    },

    /// The transfer task panicked or was cancelled.
    #[error("transfer of {volume} aborted: {reason}")]
    Aborted {
        /// Volume being transferred.
        volume: String,
        /// Join failure.
        reason: String,
    },

    /// Lock or queue failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A tool failed to start, exited non-zero, or printed something unexpected.
    #[error(transparent)]
    Exec(#[from] ExecutionError),

    /// Publishing a message failed.
    #[error(transparent)]
    Bus(#[from] ProtoError),
}

impl SyncError {
    /// True for failures caused by the request or the state of a volume
    /// rather than by a broken host.
    pub fn is_reportable(&self) -> bool {
        match self {
            SyncError::UnknownTarget { .. } | SyncError::TargetNotBound { .. } => true,
            SyncError::Store(e) => e.is_conflict(),
            SyncError::Exec(e) => e.is_command_failure(),
            SyncError::Aborted { .. } | SyncError::Bus(_) => false,
        }
    }
}
