#![warn(missing_docs)]

//! imgstor compute-node daemon: attaches volumes exported by storage nodes,
//! buffers writes in a local device-mapper overlay on sync-enabled hosts,
//! and merges those overlays back into local copies once the storage node
//! has shipped the volume over.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;

pub use config::VmConfig;
pub use controller::{SyncPass, VmController};
pub use error::VmError;
