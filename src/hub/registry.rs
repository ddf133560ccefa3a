use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use tracing::info;

/// Outbound side of a connection: frames queued here are written to the
/// client's WebSocket sink by that connection's send task.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// The authoritative set of connections eligible to receive broadcasts.
///
/// A connection appears here exactly from the moment its handshake completes
/// until it is torn down. Membership is the only identity a connection has;
/// the registry stores no session metadata.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, OutboundSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Callers mint a fresh `Uuid` per connection, so
    /// a duplicate id is a caller bug; release builds treat it as
    /// last-write-wins.
    pub async fn add(&self, id: Uuid, sender: OutboundSender) {
        let previous = self.connections.write().await.insert(id, sender);
        debug_assert!(previous.is_none(), "connection {} registered twice", id);
        info!("Added connection {} to registry", id);
    }

    /// Remove a connection if present. Idempotent: a connection's own
    /// teardown and a failed broadcast send may both try to remove it, and
    /// whichever loses the race is a no-op.
    pub async fn remove(&self, id: &Uuid) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            info!("Removed connection {} from registry", id);
        }
        removed
    }

    /// Point-in-time copy of the membership. Taken under the read lock, so
    /// it never observes a half-applied mutation; callers iterate it without
    /// holding any lock. Iteration order is unspecified.
    pub async fn snapshot(&self) -> Vec<(Uuid, OutboundSender)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
