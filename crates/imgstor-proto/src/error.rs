//! Error types for messaging.

use thiserror::Error;

/// Errors from decoding or delivering messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The payload was not valid JSON or lacked required fields.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No mailbox or peer address is known for the routing key.
    #[error("no route to {routing_key}")]
    UnknownRoute {
        /// Destination that could not be resolved.
        routing_key: String,
    },

    /// The destination mailbox has been dropped.
    #[error("mailbox for {routing_key} is closed")]
    Closed {
        /// Destination whose receiver is gone.
        routing_key: String,
    },

    /// Socket-level failure talking to a peer.
    #[error("transport error talking to {addr}: {source}")]
    Io {
        /// Peer address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A peer sent a line longer than the envelope limit.
    #[error("envelope from {addr} exceeds {limit} bytes")]
    Oversized {
        /// Peer address.
        addr: String,
        /// Limit in bytes.
        limit: usize,
    },

    /// Connecting to a peer took too long.
    #[error("timed out connecting to {addr} after {timeout_ms}ms")]
    Timeout {
        /// Peer address.
        addr: String,
        /// Configured timeout.
        timeout_ms: u64,
    },
}
