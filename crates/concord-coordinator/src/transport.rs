//! Transport abstraction for coordination messages.
//!
//! Tabs in the same process exchange messages over an in-process broadcast
//! channel. Tabs in separate processes (or a persisted-across-restart
//! deployment) exchange them through a `sled`-backed append log that every
//! participant polls. Both implement the same [`Transport`] trait so
//! [`crate::node::TabCoordinator`] never needs to know which one it's using.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use concord_message_security::SignedMessage;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::warn;

use crate::error::CoordError;

/// A bidirectional channel for signed coordination messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Broadcast `message` to every other participant.
    async fn send(&self, message: SignedMessage) -> Result<(), CoordError>;

    /// Wait for the next inbound message. Returns `None` once the transport
    /// is closed and will never yield another message.
    async fn recv(&self) -> Option<SignedMessage>;

    /// Stop delivering messages. Idempotent.
    async fn close(&self);
}

/// In-process transport backed by a `tokio::sync::broadcast` channel.
///
/// Every tab holds its own receiver so a slow tab only ever loses messages
/// off its own queue (surfaced as a lag skip, not a crash), never another
/// tab's.
pub struct BroadcastTransport {
    tx: broadcast::Sender<SignedMessage>,
    rx: AsyncMutex<broadcast::Receiver<SignedMessage>>,
    closed: AtomicBool,
}

impl BroadcastTransport {
    /// Create the shared sender for a new broadcast domain, along with one
    /// subscriber for the caller. Further tabs join via [`Self::subscribe`].
    pub fn new_domain(capacity: usize) -> (broadcast::Sender<SignedMessage>, Self) {
        let (tx, rx) = broadcast::channel(capacity);
        let transport = Self {
            tx: tx.clone(),
            rx: AsyncMutex::new(rx),
            closed: AtomicBool::new(false),
        };
        (tx, transport)
    }

    /// Join an existing broadcast domain as a new subscriber.
    pub fn subscribe(tx: &broadcast::Sender<SignedMessage>) -> Self {
        Self {
            tx: tx.clone(),
            rx: AsyncMutex::new(tx.subscribe()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send(&self, message: SignedMessage) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Transport("transport closed".into()));
        }
        // No subscribers is not an error — it just means nobody is
        // listening yet.
        let _ = self.tx.send(message);
        Ok(())
    }

    async fn recv(&self) -> Option<SignedMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast transport dropped messages under lag");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Cross-process transport backed by a `sled` tree used as an append-only
/// log. Every participant keeps its own read cursor and polls for new
/// entries; there is no push notification across processes.
pub struct SledTransport {
    db: sled::Db,
    tree: sled::Tree,
    next_read: AtomicU64,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl SledTransport {
    /// Open (or create) the append log in `db`, starting the read cursor at
    /// the current tail so a newly joined participant only sees messages
    /// sent from this point on.
    pub fn open(db: sled::Db, poll_interval: Duration) -> Result<Self, CoordError> {
        let tree = db
            .open_tree("concord_coordinator_log")
            .map_err(|e| CoordError::Transport(e.to_string()))?;
        let tail = tree
            .last()
            .map_err(|e| CoordError::Transport(e.to_string()))?
            .map(|(k, _)| u64::from_be_bytes(k.as_ref().try_into().unwrap_or_default()) + 1)
            .unwrap_or(0);
        Ok(Self {
            db,
            tree,
            next_read: AtomicU64::new(tail),
            poll_interval,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for SledTransport {
    async fn send(&self, message: SignedMessage) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Transport("transport closed".into()));
        }
        let seq = self
            .db
            .generate_id()
            .map_err(|e| CoordError::Transport(e.to_string()))?;
        let bytes = serde_json::to_vec(&message).map_err(|e| CoordError::Transport(e.to_string()))?;
        self.tree
            .insert(seq.to_be_bytes(), bytes)
            .map_err(|e| CoordError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Option<SignedMessage> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let next = self.next_read.load(Ordering::SeqCst);
            let found = self
                .tree
                .range(next.to_be_bytes()..)
                .next()
                .and_then(|r| r.ok());
            match found {
                Some((k, v)) => {
                    let seq = u64::from_be_bytes(k.as_ref().try_into().unwrap_or_default());
                    self.next_read.store(seq + 1, Ordering::SeqCst);
                    match serde_json::from_slice::<SignedMessage>(&v) {
                        Ok(message) => return Some(message),
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable coordinator log entry");
                            continue;
                        }
                    }
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_message_security::{sign, Message, SigningKey};
    use concord_types::TabId;
    use serde_json::json;

    fn sample() -> SignedMessage {
        let key = SigningKey::from_bytes(b"test-key".to_vec());
        sign(
            Message {
                logical_timestamp: 1,
                sender_id: TabId::from("tab-a"),
                nonce: "tab-a_0_1".to_string(),
                timestamp: None,
                payload: json!({"kind": "heartbeat"}),
            },
            &key,
        )
    }

    #[tokio::test]
    async fn broadcast_transport_delivers_to_a_subscriber() {
        let (tx, sender_side) = BroadcastTransport::new_domain(8);
        let receiver_side = BroadcastTransport::subscribe(&tx);

        sender_side.send(sample()).await.unwrap();
        let received = receiver_side.recv().await.unwrap();
        assert_eq!(received.message.sender_id, TabId::from("tab-a"));
    }

    #[tokio::test]
    async fn sled_transport_round_trips_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let transport = SledTransport::open(db, Duration::from_millis(5)).unwrap();

        transport.send(sample()).await.unwrap();
        let received = transport.recv().await.unwrap();
        assert_eq!(received.message.sender_id, TabId::from("tab-a"));
    }

    #[tokio::test]
    async fn sled_transport_only_sees_messages_sent_after_it_opened() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let early = SledTransport::open(db.clone(), Duration::from_millis(5)).unwrap();
        early.send(sample()).await.unwrap();

        let late = SledTransport::open(db, Duration::from_millis(5)).unwrap();
        late.send(sample()).await.unwrap();

        // The late-joining transport's cursor starts at the tail, so it
        // only observes the message sent after it opened.
        let received = late.recv().await.unwrap();
        assert_eq!(received.message.sender_id, TabId::from("tab-a"));
        assert_eq!(early.recv().await.unwrap().message.sender_id, TabId::from("tab-a"));
    }
}
