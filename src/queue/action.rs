//! Deferred actions and how they are replayed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

use super::QueueItem;
use crate::error::{Result, WorkerError};
use crate::fetch::Fetcher;

/// Largest raster edge the encoder is asked for.
const MAX_EDGE: u32 = 4096;

/// A write action that could not complete while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
  /// Render `text` as a QR code
  Generate(GenerateAction),
}

impl Action {
  /// Decode and validate a queue payload.
  pub fn parse(payload: &Value) -> Result<Self> {
    let action: Action = serde_json::from_value(payload.clone())
      .map_err(|e| WorkerError::Validation(format!("Unrecognized action: {}", e)))?;
    action.validate()?;
    Ok(action)
  }

  fn validate(&self) -> Result<()> {
    match self {
      Action::Generate(generate) => generate.validate(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateAction {
  pub text: String,
  #[serde(flatten)]
  pub options: EncodeOptions,
}

impl GenerateAction {
  fn validate(&self) -> Result<()> {
    if self.text.trim().is_empty() {
      return Err(WorkerError::Validation("text must not be empty".into()));
    }
    self.options.validate()
  }
}

/// Error correction level handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CorrectionLevel {
  L,
  #[default]
  M,
  Q,
  H,
}

/// Raster configuration for the external encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncodeOptions {
  pub width: u32,
  pub height: u32,
  pub color_dark: String,
  pub color_light: String,
  pub correct_level: CorrectionLevel,
}

impl Default for EncodeOptions {
  fn default() -> Self {
    Self {
      width: 300,
      height: 300,
      color_dark: "#000000".to_string(),
      color_light: "#ffffff".to_string(),
      correct_level: CorrectionLevel::M,
    }
  }
}

impl EncodeOptions {
  fn validate(&self) -> Result<()> {
    for (name, edge) in [("width", self.width), ("height", self.height)] {
      if edge == 0 || edge > MAX_EDGE {
        return Err(WorkerError::Validation(format!(
          "{} must be between 1 and {}, got {}",
          name, MAX_EDGE, edge
        )));
      }
    }
    for color in [&self.color_dark, &self.color_light] {
      if !is_hex_color(color) {
        return Err(WorkerError::Validation(format!(
          "Invalid color '{}', expected #rrggbb",
          color
        )));
      }
    }
    Ok(())
  }
}

fn is_hex_color(s: &str) -> bool {
  s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Performs a queued action. Errors leave the item pending.
#[async_trait]
pub trait ActionHandler: Send + Sync {
  async fn replay(&self, item: &QueueItem) -> Result<()>;
}

/// Replays actions by POSTing them to the generation endpoint.
pub struct ReplayHandler {
  fetcher: Arc<dyn Fetcher>,
  endpoint: Url,
}

impl ReplayHandler {
  pub fn new(fetcher: Arc<dyn Fetcher>, endpoint: Url) -> Self {
    Self { fetcher, endpoint }
  }
}

#[async_trait]
impl ActionHandler for ReplayHandler {
  async fn replay(&self, item: &QueueItem) -> Result<()> {
    let action = Action::parse(&item.payload)?;
    let body = json!({
      "id": item.id,
      "timestamp": item.timestamp,
      "action": action,
    });

    let response = self.fetcher.post_json(&self.endpoint, &body).await?;
    if !response.is_success() {
      return Err(WorkerError::Transport(format!(
        "{} answered {}",
        self.endpoint, response.status
      )));
    }
    Ok(())
  }
}
