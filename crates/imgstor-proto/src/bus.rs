//! The message bus seam.
//!
//! Daemons publish through [`MessageBus`] and consume [`Delivery`] values
//! from an mpsc receiver. [`LocalBus`] wires mailboxes together in-process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::{Delivery, Properties};
use crate::error::ProtoError;
use crate::message::Payload;

/// Publishes payloads to a named destination.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Sends `payload` to the mailbox named `routing_key`.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &Payload,
        props: Properties,
    ) -> Result<(), ProtoError>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &Payload,
        props: Properties,
    ) -> Result<(), ProtoError> {
        (**self).publish(routing_key, payload, props).await
    }
}

/// In-process bus: one unbounded mailbox per name.
#[derive(Debug, Default, Clone)]
pub struct LocalBus {
    mailboxes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>>,
}

impl LocalBus {
    /// Creates a bus with no mailboxes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` and returns its receiving end. Registering a name
    /// again replaces the previous mailbox.
    pub fn mailbox(&self, name: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.mailboxes.lock().insert(name.to_string(), tx).is_some() {
            warn!(mailbox = name, "replaced existing mailbox");
        }
        rx
    }

    /// Registered mailbox names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mailboxes.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &Payload,
        props: Properties,
    ) -> Result<(), ProtoError> {
        let body = payload.to_json()?;
        let tx = self
            .mailboxes
            .lock()
            .get(routing_key)
            .cloned()
            .ok_or_else(|| ProtoError::UnknownRoute {
                routing_key: routing_key.to_string(),
            })?;
        debug!(routing_key, body = %body, "publishing");
        tx.send(Delivery {
            props: props.ensure_message_id(),
            body,
        })
        .map_err(|_| ProtoError::Closed {
            routing_key: routing_key.to_string(),
        })
    }
}
