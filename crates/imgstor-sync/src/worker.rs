//! Single-slot blocking worker for transfers.

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SyncError;

struct Running {
    volume: String,
    handle: JoinHandle<Result<(), SyncError>>,
}

/// Runs at most one blocking job at a time and reports its outcome once
/// it has finished, without waiting for it.
#[derive(Default)]
pub struct TransferWorker {
    slot: Option<Running>,
}

impl TransferWorker {
    /// An idle worker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Volume of the job occupying the slot.
    pub fn current(&self) -> Option<&str> {
        self.slot.as_ref().map(|r| r.volume.as_str())
    }

    /// Starts `job` for `volume`; returns false if the slot is taken.
    pub fn start<F>(&mut self, volume: impl Into<String>, job: F) -> bool
    where
        F: FnOnce() -> Result<(), SyncError> + Send + 'static,
    {
        if self.slot.is_some() {
            return false;
        }
        let volume = volume.into();
        debug!(volume = %volume, "worker started");
        self.slot = Some(Running {
            volume,
            handle: tokio::task::spawn_blocking(job),
        });
        true
    }

    /// Takes the outcome of a finished job and frees the slot. `None` while
    /// the job runs or when idle.
    pub async fn take_finished(&mut self) -> Option<(String, Result<(), SyncError>)> {
        if !self.slot.as_ref()?.handle.is_finished() {
            return None;
        }
        let Running { volume, handle } = self.slot.take()?;
        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Aborted {
                volume: volume.clone(),
                reason: e.to_string(),
            }),
        };
        Some((volume, outcome))
    }
}
