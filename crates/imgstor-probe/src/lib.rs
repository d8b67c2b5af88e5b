#![warn(missing_docs)]

//! imgstor device probing: structured invocations of the storage tools and
//! parsers for their output.
//!
//! Commands are built as argument vectors by the per-tool modules and run
//! through a [`CommandRunner`]; remote invocations carry the host and the
//! escalation user as data rather than as pre-built shell strings.

pub mod blockdev;
pub mod dm;
pub mod exec;
pub mod fakes;
pub mod iscsi;
pub mod probe;
pub mod tgt;
pub mod zfs;

pub use dm::{MergeProgress, OverlayMode, OverlayStatus, Table};
pub use exec::{
    Command, CommandFailureInfo, CommandRunner, ExecutionError, HostRunner, Invocation,
    RemoteCommand,
};
pub use probe::DeviceProbe;
pub use tgt::TgtTarget;
pub use zfs::Zfs;
