//! Error types for the job store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by [`crate::JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another operation already holds the lock for this volume.
    #[error("ZVol {volume} is busy")]
    VolumeBusy {
        /// Volume that is locked.
        volume: String,
        /// Requester holding the lock.
        holder: String,
    },

    /// A sync job for this volume is already queued.
    #[error("sync already pending for zvol {volume}")]
    SyncPending {
        /// Volume with a pending job.
        volume: String,
    },

    /// A sync job for this target is already queued under another volume.
    #[error("sync already pending for target {target} (zvol {volume})")]
    TargetPending {
        /// Target of the pending job.
        target: String,
        /// Volume the pending job belongs to.
        volume: String,
    },

    /// A replication job for this volume is already queued.
    #[error("replication already pending for zvol {volume}")]
    ReplicationPending {
        /// Volume with a pending job.
        volume: String,
    },

    /// No sync job exists for this volume.
    #[error("no sync job queued for zvol {volume}")]
    NoSyncJob {
        /// Volume that was looked up.
        volume: String,
    },

    /// Reading or writing the store file failed.
    #[error("store I/O error on {}: {source}", path.display())]
    Io {
        /// Store file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store file could not be decoded.
    #[error("store file {} is corrupt: {source}", path.display())]
    Corrupt {
        /// Store file path.
        path: PathBuf,
        /// Decoding error.
        #[source]
        source: bincode::Error,
    },

    /// The store file was written by an incompatible version.
    #[error("unsupported store version {found} (expected {expected})")]
    Version {
        /// Version found in the file.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// Encoding the store state failed.
    #[error("store encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl StoreError {
    /// True for conflicts caused by concurrent requests on the same volume.
    ///
    /// These are expected, reportable outcomes rather than store faults.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VolumeBusy { .. }
                | StoreError::SyncPending { .. }
                | StoreError::TargetPending { .. }
                | StoreError::ReplicationPending { .. }
                | StoreError::NoSyncJob { .. }
        )
    }
}
