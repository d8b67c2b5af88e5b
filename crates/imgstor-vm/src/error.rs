//! Controller errors.

use imgstor_probe::{ExecutionError, OverlayMode};
use imgstor_proto::ProtoError;
use imgstor_store::StoreError;
use thiserror::Error;

/// Errors from the mapping/sync controller.
#[derive(Debug, Error)]
pub enum VmError {
    /// Discovery on the storage node did not list the target.
    #[error("Could not find iSCSI target {target} on {nas}")]
    TargetNotFound {
        /// Target IQN.
        target: String,
        /// Storage node queried.
        nas: String,
    },

    /// No local block device appeared for the target.
    #[error("Not found {target} in targets")]
    DeviceNotFound {
        /// Target IQN.
        target: String,
    },

    /// The device stayed open past the polling bound.
    #[error("Device {device} is busy")]
    DeviceBusy {
        /// Device-mapper name.
        device: String,
    },

    /// The request cannot be served as given.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What is wrong with it.
        reason: String,
    },

    /// The overlay is in a mode the next table cannot follow.
    #[error("overlay {device} cannot go from {from} to {to}")]
    ModeTransition {
        /// Device-mapper name.
        device: String,
        /// Mode reported by `dmsetup status`.
        from: OverlayMode,
        /// Mode about to be loaded.
        to: OverlayMode,
    },

    /// Lock or queue failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A tool failed to start, exited non-zero, or printed something unexpected.
    #[error(transparent)]
    Exec(#[from] ExecutionError),

    /// Publishing a reply failed.
    #[error(transparent)]
    Bus(#[from] ProtoError),
}

impl VmError {
    /// Builds an [`VmError::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        VmError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// True for failures reported back to the requester as an ordinary
    /// error reply; false for failures that point at a broken host.
    pub fn is_reportable(&self) -> bool {
        match self {
            VmError::TargetNotFound { .. }
            | VmError::DeviceNotFound { .. }
            | VmError::DeviceBusy { .. }
            | VmError::InvalidRequest { .. } => true,
            VmError::Store(e) => e.is_conflict(),
            VmError::Exec(e) => e.is_command_failure(),
            VmError::ModeTransition { .. } | VmError::Bus(_) => false,
        }
    }
}
