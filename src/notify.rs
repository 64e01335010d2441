//! Broadcast channel to every connected consumer.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Ephemeral message sent to all consumers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientNotification {
  /// A new worker version took control
  Activated { message: String },
  /// A queued action was replayed successfully
  ActionCompleted { data: Value },
}

/// Fan-out sender. Consumers are not required to acknowledge, and a send with
/// no subscribers is not an error.
#[derive(Clone)]
pub struct Broadcaster {
  tx: broadcast::Sender<ClientNotification>,
}

impl Broadcaster {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientNotification> {
    self.tx.subscribe()
  }

  /// Number of consumers currently connected.
  pub fn consumers(&self) -> usize {
    self.tx.receiver_count()
  }

  pub fn send(&self, notification: ClientNotification) {
    let delivered = self.tx.send(notification).unwrap_or(0);
    trace!(delivered, "broadcast");
  }
}

impl Default for Broadcaster {
  fn default() -> Self {
    Self::new(64)
  }
}
