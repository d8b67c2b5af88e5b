#![warn(missing_docs)]

//! imgstor messaging: the closed set of action messages exchanged between
//! compute and storage nodes, the [`MessageBus`] seam with in-process and
//! TCP implementations, and the [`PollTimer`] used by the daemon loops.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod message;
pub mod tcp;
pub mod timer;

pub use bus::{LocalBus, MessageBus};
pub use envelope::{Delivery, Properties};
pub use error::ProtoError;
pub use message::{
    Action, DevListBody, Failure, NodeType, OverlayEntry, Payload, Status, TargetDevice,
    ACTION_UNSUPPORTED,
};
pub use tcp::{serve, TcpBus};
pub use timer::PollTimer;
