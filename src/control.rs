//! Control channel messages and replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Typed control messages accepted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate without waiting for old consumers to go away
  SkipWaiting,
  GetCacheSize,
  ClearCache,
  /// Defer an action until connectivity returns
  AddToQrQueue {
    #[serde(default)]
    data: Value,
  },
}

impl ControlMessage {
  /// Decode a raw message. Unknown types yield `None` and are meant to be ignored.
  pub fn from_value(value: Value) -> Option<Self> {
    serde_json::from_value(value).ok()
  }
}

/// Reply delivered on the per-message reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
  Size { size: u64 },
  Success { success: bool },
}

/// A control message plus the channel its reply goes back on.
#[derive(Debug)]
pub struct ControlEnvelope {
  pub message: ControlMessage,
  pub reply: Option<oneshot::Sender<ControlReply>>,
}

impl ControlEnvelope {
  /// Wrap a message that expects a reply.
  pub fn request(message: ControlMessage) -> (Self, oneshot::Receiver<ControlReply>) {
    let (tx, rx) = oneshot::channel();
    (
      Self {
        message,
        reply: Some(tx),
      },
      rx,
    )
  }

  pub fn respond(self, reply: ControlReply) {
    if let Some(tx) = self.reply {
      // Ignore send errors - requester may have gone away
      let _ = tx.send(reply);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decodes_known_types() {
    assert_eq!(
      ControlMessage::from_value(json!({"type": "GET_CACHE_SIZE"})),
      Some(ControlMessage::GetCacheSize)
    );
    assert_eq!(
      ControlMessage::from_value(json!({"type": "SKIP_WAITING"})),
      Some(ControlMessage::SkipWaiting)
    );
    assert_eq!(
      ControlMessage::from_value(json!({
        "type": "ADD_TO_QR_QUEUE",
        "data": {"type": "generate", "text": "hello"}
      })),
      Some(ControlMessage::AddToQrQueue {
        data: json!({"type": "generate", "text": "hello"})
      })
    );
  }

  #[test]
  fn test_unknown_type_is_none() {
    assert_eq!(ControlMessage::from_value(json!({"type": "REBOOT"})), None);
    assert_eq!(ControlMessage::from_value(json!("CLEAR_CACHE")), None);
  }

  #[test]
  fn test_reply_wire_format() {
    assert_eq!(
      serde_json::to_value(ControlReply::Size { size: 42 }).unwrap(),
      json!({"size": 42})
    );
    assert_eq!(
      serde_json::to_value(ControlReply::Success { success: true }).unwrap(),
      json!({"success": true})
    );
  }

  #[tokio::test]
  async fn test_respond_reaches_requester() {
    let (envelope, rx) = ControlEnvelope::request(ControlMessage::ClearCache);
    envelope.respond(ControlReply::Success { success: true });
    assert_eq!(rx.await.unwrap(), ControlReply::Success { success: true });
  }
}
