use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::control::ControlEnvelope;

/// Worker events
#[derive(Debug)]
pub enum Event {
  /// Message on the control channel
  Control(ControlEnvelope),
  /// Connectivity restored; replay the offline queue
  Online,
  /// Push-style wake signal carrying its JSON data
  Push(Value),
  /// Periodic tick; also replays the offline queue
  Tick,
  /// Stop the event loop
  Shutdown,
}

/// Event handler that merges externally sent events with a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick fires immediately; skip it
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for producers (stdin reader, signal handlers, tests)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
