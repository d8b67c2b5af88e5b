//! TCP message bus.
//!
//! Each published message opens a connection to the peer that owns the
//! routing key and writes one newline-terminated JSON envelope.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::envelope::{Delivery, Properties};
use crate::error::ProtoError;
use crate::message::Payload;

/// Longest envelope line accepted from a peer.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    routing_key: String,
    #[serde(default)]
    props: Properties,
    body: serde_json::Value,
}

/// Bus that delivers to peers over TCP.
#[derive(Debug, Clone)]
pub struct TcpBus {
    peers: HashMap<String, String>,
    connect_timeout: Duration,
}

impl TcpBus {
    /// Creates a bus routing each name in `peers` to its `host:port`.
    pub fn new(peers: HashMap<String, String>, connect_timeout: Duration) -> Self {
        Self {
            peers,
            connect_timeout,
        }
    }

    /// Address registered for `routing_key`.
    pub fn peer(&self, routing_key: &str) -> Option<&str> {
        self.peers.get(routing_key).map(String::as_str)
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, ProtoError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtoError::Timeout {
                addr: addr.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|source| ProtoError::Io {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).map_err(|source| ProtoError::Io {
            addr: addr.to_string(),
            source,
        })?;
        Ok(stream)
    }
}

#[async_trait]
impl MessageBus for TcpBus {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &Payload,
        props: Properties,
    ) -> Result<(), ProtoError> {
        let addr = self.peer(routing_key).ok_or_else(|| ProtoError::UnknownRoute {
            routing_key: routing_key.to_string(),
        })?;
        let envelope = WireEnvelope {
            routing_key: routing_key.to_string(),
            props: props.ensure_message_id(),
            body: serde_json::to_value(payload)?,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut stream = self.connect(addr).await?;
        let io_err = |source: std::io::Error| ProtoError::Io {
            addr: addr.to_string(),
            source,
        };
        stream.write_all(&line).await.map_err(io_err)?;
        stream.flush().await.map_err(io_err)?;
        stream.shutdown().await.map_err(io_err)?;
        debug!(routing_key, addr, "published over tcp");
        Ok(())
    }
}

/// Accepts connections on `listener` and forwards every envelope addressed
/// to `node_name` into `tx`. Returns when `tx` is closed.
pub async fn serve(
    listener: TcpListener,
    node_name: String,
    tx: mpsc::UnboundedSender<Delivery>,
) -> Result<(), ProtoError> {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(addr = %local, node = %node_name, "listening for messages");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.map_err(|source| ProtoError::Io {
                addr: local.clone(),
                source,
            })?,
            _ = tx.closed() => return Ok(()),
        };
        let tx = tx.clone();
        let node_name = node_name.clone();
        tokio::spawn(async move {
            if let Err(e) = read_envelopes(stream, &node_name, &tx).await {
                warn!(peer = %peer, error = %e, "dropping connection");
            }
        });
    }
}

async fn read_envelopes(
    stream: TcpStream,
    node_name: &str,
    tx: &mpsc::UnboundedSender<Delivery>,
) -> Result<(), ProtoError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|source| ProtoError::Io {
                addr: peer.clone(),
                source,
            })?;
        if read == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if buf.len() > MAX_LINE_BYTES {
            warn!(peer = %peer, "envelope too large");
            return Err(ProtoError::Oversized {
                addr: peer,
                limit: MAX_LINE_BYTES,
            });
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(e) => {
                warn!(peer = %peer, error = %e, "envelope is not utf-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let envelope: WireEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %peer, error = %e, "undecodable envelope");
                continue;
            }
        };
        if envelope.routing_key != node_name {
            warn!(routing_key = %envelope.routing_key, node = node_name, "misrouted envelope");
            continue;
        }
        let delivery = Delivery {
            props: envelope.props,
            body: envelope.body.to_string(),
        };
        if tx.send(delivery).is_err() {
            return Err(ProtoError::Closed {
                routing_key: node_name.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, Status};

    #[tokio::test]
    async fn test_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, "nas-0-1".to_string(), tx));

        let mut peers = HashMap::new();
        peers.insert("nas-0-1".to_string(), addr);
        let bus = TcpBus::new(peers, Duration::from_secs(5));
        let payload = Payload::from(Action::ZvolMapped {
            target: "iqn.t".into(),
            bdev: Some("/dev/mapper/v1-snap".into()),
            status: Status::Success,
            error: None,
        });
        bus.publish(
            "nas-0-1",
            &payload,
            Properties::new().reply_to("compute-0-1").correlation_id(Some("c1".into())),
        )
        .await
        .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.props.reply_to.as_deref(), Some("compute-0-1"));
        assert_eq!(delivery.props.correlation_id.as_deref(), Some("c1"));
        assert_eq!(Payload::from_json(&delivery.body).unwrap(), payload);

        drop(rx);
        server.abort();
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, "nas-0-1".to_string(), tx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let chunk = vec![b'x'; 64 * 1024];
        let mut written = 0;
        let mut closed = false;
        // The server stops reading once the limit is passed, so writes
        // eventually fail instead of being buffered without end.
        while written < 64 * MAX_LINE_BYTES {
            match stream.write_all(&chunk).await {
                Ok(()) => written += chunk.len(),
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "connection still open after {} bytes", written);
        assert!(rx.try_recv().is_err());

        drop(rx);
        server.abort();
    }

    #[tokio::test]
    async fn test_undecodable_line_keeps_connection_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, "nas-0-1".to_string(), tx));

        let envelope = WireEnvelope {
            routing_key: "nas-0-1".into(),
            props: Properties::new(),
            body: serde_json::json!({"action": "list_dev"}),
        };
        let mut line = serde_json::to_vec(&envelope).unwrap();
        line.push(b'\n');
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"not json\n").await.unwrap();
        stream.write_all(&line).await.unwrap();
        stream.shutdown().await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(
            Payload::from_json(&delivery.body).unwrap(),
            Payload::from(Action::ListDev)
        );

        drop(rx);
        server.abort();
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let bus = TcpBus::new(HashMap::new(), Duration::from_millis(100));
        let err = bus
            .publish("compute-0-1", &Action::ListDev.into(), Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnknownRoute { .. }));
    }
}
