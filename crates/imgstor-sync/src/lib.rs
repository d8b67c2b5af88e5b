#![warn(missing_docs)]

//! imgstor storage-node daemon: queues volume replication towards and back
//! from sync-enabled compute nodes, runs one transfer at a time, tells the
//! compute node when its copy is ready and retires the iSCSI export once the
//! compute node reports the merge done.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod inventory;
pub mod transfer;
pub mod worker;

pub use config::SyncConfig;
pub use coordinator::{Coordinator, PollOutcome};
pub use error::SyncError;
pub use inventory::{HostAttributes, StaticInventory};
pub use transfer::Transfer;
pub use worker::TransferWorker;
