//! Action messages.
//!
//! Every payload is a JSON object tagged by its `action` field. Unknown
//! actions decode to [`Action::Unsupported`]; known actions with missing
//! required fields fail to decode.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtoError;

/// Error string sent back for actions a daemon does not handle.
pub const ACTION_UNSUPPORTED: &str = "action_unsupported";

/// Outcome carried by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The operation failed; `error` says why.
    Error,
}

/// Kind of compute node answering `list_dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Overlay-backed node that syncs volumes locally.
    Sync,
    /// Plain iSCSI initiator.
    Iscsi,
}

/// `list_dev` entry on a plain iSCSI node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    /// Target IQN.
    pub target: String,
    /// Local disk name.
    pub device: String,
}

/// `list_dev` entry on a sync node, keyed by volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    /// Device-mapper device name.
    pub dev: String,
    /// Current table mode.
    pub status: String,
    /// Table size in GiB.
    pub size: u64,
    /// Exception-store usage while not linear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced: Option<String>,
    /// Target the overlay reads through, if still connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Local disk of that target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bdev: Option<String>,
    /// Whether the merge has been started, if a sync job is queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    /// When the sync job was queued (seconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

/// Body of a `dev_list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DevListBody {
    /// Overlays keyed by volume.
    Sync(BTreeMap<String, OverlayEntry>),
    /// Sessions as a list.
    Iscsi(Vec<TargetDevice>),
}

/// Every action exchanged by the daemons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Attach `target` from `nas` and expose it locally.
    MapZvol {
        /// Target IQN.
        target: String,
        /// Storage node exporting the target.
        nas: String,
        /// Volume size in GiB.
        #[serde(deserialize_with = "size_from_any")]
        size: u64,
        /// Volume name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zvol: Option<String>,
    },
    /// Detach a previously mapped volume.
    UnmapZvol {
        /// Target IQN.
        target: String,
        /// Volume name.
        zvol: String,
    },
    /// Report local devices.
    ListDev,
    /// Start merging the overlay of `zvol` into the local copy.
    SyncZvol {
        /// Volume name.
        zvol: String,
        /// Target the overlay currently reads through.
        target: String,
    },
    /// Result of `map_zvol`.
    ZvolMapped {
        /// Target IQN.
        target: String,
        /// Local device exposing the volume.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bdev: Option<String>,
        /// Outcome.
        status: Status,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of `unmap_zvol`, or of a `map_zvol` that failed unexpectedly.
    ZvolUnmapped {
        /// Target IQN.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        /// Volume name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zvol: Option<String>,
        /// Outcome.
        status: Status,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of `sync_zvol`.
    ZvolSynced {
        /// Volume name.
        zvol: String,
        /// Outcome.
        status: Status,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Result of `list_dev`.
    DevList {
        /// Outcome.
        status: Status,
        /// Kind of node.
        node_type: NodeType,
        /// Devices.
        body: DevListBody,
    },
    /// Any action this build does not know.
    #[serde(other)]
    Unsupported,
}

impl Action {
    /// Decodes an inbound payload.
    pub fn from_json(body: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::MapZvol { .. } => "map_zvol",
            Action::UnmapZvol { .. } => "unmap_zvol",
            Action::ListDev => "list_dev",
            Action::SyncZvol { .. } => "sync_zvol",
            Action::ZvolMapped { .. } => "zvol_mapped",
            Action::ZvolUnmapped { .. } => "zvol_unmapped",
            Action::ZvolSynced { .. } => "zvol_synced",
            Action::DevList { .. } => "dev_list",
            Action::Unsupported => "unsupported",
        }
    }
}

fn size_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| D::Error::custom(format!("invalid size {:?}: {}", s, e))),
    }
}

/// Untagged error reply: `{status: error, error: <reason>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Always [`Status::Error`].
    pub status: Status,
    /// Reason.
    pub error: String,
}

impl Failure {
    /// Builds an error reply.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            error: error.into(),
        }
    }
}

/// Anything a daemon publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A tagged action.
    Action(Action),
    /// An error reply to an undecodable or unsupported request.
    Failure(Failure),
}

impl Payload {
    /// Encodes the payload as JSON.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a published payload.
    pub fn from_json(body: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(body)?)
    }
}

impl From<Action> for Payload {
    fn from(action: Action) -> Self {
        Payload::Action(action)
    }
}

impl From<Failure> for Payload {
    fn from(failure: Failure) -> Self {
        Payload::Failure(failure)
    }
}
