//! Error types for the worker.

use thiserror::Error;

/// Errors surfaced by the cache registry, the strategy executors and the offline queue.
#[derive(Debug, Error)]
pub enum WorkerError {
  /// Network unreachable, timed out, or the connection dropped mid-body.
  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Storage error: {0}")]
  Storage(String),

  /// Nothing cached under the requested name or key.
  #[error("Not found in cache: {0}")]
  NotFound(String),

  /// A queued action carried a payload we cannot act on.
  #[error("Invalid payload: {0}")]
  Validation(String),

  #[error("Configuration error: {0}")]
  Config(String),
}

impl WorkerError {
  pub fn is_transport(&self) -> bool {
    matches!(self, WorkerError::Transport(_))
  }
}

impl From<rusqlite::Error> for WorkerError {
  fn from(err: rusqlite::Error) -> Self {
    WorkerError::Storage(err.to_string())
  }
}

impl From<reqwest::Error> for WorkerError {
  fn from(err: reqwest::Error) -> Self {
    WorkerError::Transport(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
