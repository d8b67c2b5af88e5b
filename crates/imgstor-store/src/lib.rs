#![warn(missing_docs)]

//! imgstor job store: per-volume lock entries, the merge-back sync queue and
//! the cross-node replication queue.
//!
//! Every mutation is applied under a single mutex and written to the store
//! file before it becomes visible, so queued work survives a daemon restart.

pub mod error;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::JobStore;
pub use types::{now_us, Direction, LockEntry, ReplicationJob, SyncJob};
