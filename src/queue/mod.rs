//! Durable queue of actions deferred while offline.
//!
//! Items are append/delete only. Each deletion is its own transaction, so a
//! crash mid-drain leaves completed items gone and everything else pending.

mod action;

pub use action::{Action, ActionHandler, CorrectionLevel, EncodeOptions, GenerateAction, ReplayHandler};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::notify::{Broadcaster, ClientNotification};

/// A pending deferred action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
  /// Unique, monotonic; milliseconds since the epoch at enqueue unless that collides
  pub id: i64,
  pub payload: Value,
  /// Replay order
  pub timestamp: DateTime<Utc>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub completed: Vec<i64>,
  pub failed: Vec<i64>,
}

/// A queue row as stored, before its payload and timestamp are decoded.
struct StoredRow {
  id: i64,
  payload: String,
  timestamp: String,
}

impl StoredRow {
  fn decode(self) -> Result<QueueItem> {
    let id = self.id;
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| WorkerError::Storage(format!("Corrupt payload for item {}: {}", id, e)))?;
    let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| WorkerError::Storage(format!("Corrupt timestamp for item {}: {}", id, e)))?;
    Ok(QueueItem {
      id,
      payload,
      timestamp,
    })
  }
}

/// SQLite-backed offline action queue.
pub struct OfflineQueue {
  conn: Mutex<Connection>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS qr_queue (
    id INTEGER PRIMARY KEY,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_qr_queue_timestamp ON qr_queue(timestamp);
"#;

impl OfflineQueue {
  /// Open or create the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| WorkerError::Storage(format!("Failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      WorkerError::Storage(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| WorkerError::Storage(format!("Failed to run queue migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Persist a validated action and return its id. Never touches the network.
  pub fn enqueue(&self, payload: Value) -> Result<i64> {
    Action::parse(&payload)?;

    let now = Utc::now();
    let data = serde_json::to_string(&payload)
      .map_err(|e| WorkerError::Storage(format!("Failed to serialize payload: {}", e)))?;

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let last: i64 = tx.query_row("SELECT COALESCE(MAX(id), 0) FROM qr_queue", [], |row| {
      row.get(0)
    })?;
    let id = now.timestamp_millis().max(last + 1);
    tx.execute(
      "INSERT INTO qr_queue (id, payload, timestamp) VALUES (?1, ?2, ?3)",
      params![id, data, now.to_rfc3339_opts(SecondsFormat::Micros, true)],
    )?;
    tx.commit()?;

    info!(id, "Queued action for later replay");
    Ok(id)
  }

  /// All pending items in replay order. Fails if any stored row is corrupt.
  pub fn pending(&self) -> Result<Vec<QueueItem>> {
    self.rows()?.into_iter().map(StoredRow::decode).collect()
  }

  fn rows(&self) -> Result<Vec<StoredRow>> {
    let conn = self.conn()?;
    let mut stmt =
      conn.prepare("SELECT id, payload, timestamp FROM qr_queue ORDER BY timestamp, id")?;
    let rows = stmt
      .query_map([], |row| {
        Ok(StoredRow {
          id: row.get(0)?,
          payload: row.get(1)?,
          timestamp: row.get(2)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM qr_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Delete an item. Removing an absent id is not an error.
  pub fn remove(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM qr_queue WHERE id = ?1", params![id])?;
    Ok(())
  }

  /// Try every pending item once.
  ///
  /// Successful items are deleted, then announced to all consumers; failures stay
  /// queued for the next drain. One item's failure never stops the pass.
  pub async fn drain_all(
    &self,
    handler: &dyn ActionHandler,
    broadcaster: &Broadcaster,
  ) -> Result<DrainReport> {
    let rows = self.rows()?;
    let mut report = DrainReport::default();

    for row in rows {
      let id = row.id;
      let item = match row.decode() {
        Ok(item) => item,
        Err(e) => {
          warn!(id, error = %e, "Skipping unreadable queued action");
          report.failed.push(id);
          continue;
        }
      };

      match handler.replay(&item).await {
        Ok(()) => {
          if let Err(e) = self.remove(item.id) {
            // Still pending; the next drain replays it again.
            warn!(id = item.id, error = %e, "Failed to remove replayed item");
            report.failed.push(item.id);
            continue;
          }
          broadcaster.send(ClientNotification::ActionCompleted { data: item.payload });
          report.completed.push(item.id);
        }
        Err(e) if e.is_transport() => {
          debug!(id = item.id, error = %e, "Still offline, keeping queued action");
          report.failed.push(item.id);
        }
        Err(e) => {
          warn!(id = item.id, error = %e, "Failed to replay queued action");
          report.failed.push(item.id);
        }
      }
    }

    info!(
      completed = report.completed.len(),
      failed = report.failed.len(),
      "Queue drained"
    );
    Ok(report)
  }
}
