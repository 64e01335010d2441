use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Generations;
use crate::strategy::{StrategyRules, DEFAULT_CACHE_FIRST, DEFAULT_NETWORK_FIRST};
use crate::worker::WorkerOptions;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Worker version; generation names are derived from it
  pub version: String,
  /// Base URL that relative asset paths resolve against
  pub origin: String,
  /// Required for the worker to be useful offline
  pub static_assets: Vec<String>,
  /// Nice to have; failures are skipped at install
  pub dynamic_assets: Vec<String>,
  pub offline_page: String,
  pub network_first_patterns: Vec<String>,
  pub cache_first_patterns: Vec<String>,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub fetch: FetchConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Set to false to run without any response cache
  pub enabled: bool,
  pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub db_path: Option<PathBuf>,
  /// Endpoint deferred actions are POSTed to when connectivity returns
  pub replay_url: String,
  /// Periodic drain, in addition to explicit connectivity signals
  pub drain_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, e.g. "info" or "qrworker=debug"
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "v2.0.0".to_string(),
      origin: "http://localhost:8080".to_string(),
      static_assets: [
        "/",
        "/index.html",
        "/manifest.json",
        "/favicon.svg",
        "/favicon.ico",
        "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700;800&display=swap",
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      dynamic_assets: vec![
        "https://cdn.jsdelivr.net/npm/qrcode-generator@1.4.4/qrcode.min.js".to_string(),
        "https://cdn.jsdelivr.net/npm/jsqr@1.4.0/dist/jsQR.js".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      network_first_patterns: DEFAULT_NETWORK_FIRST.iter().map(|s| s.to_string()).collect(),
      cache_first_patterns: DEFAULT_CACHE_FIRST.iter().map(|s| s.to_string()).collect(),
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      fetch: FetchConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      db_path: None,
    }
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      db_path: None,
      replay_url: "http://localhost:8080/api/qr".to_string(),
      drain_interval_secs: 300,
    }
  }
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./qrworker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/qrworker/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("qrworker.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("qrworker").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.replay_url()?;
    self.strategy_rules()?;
    Ok(())
  }

  pub fn generations(&self) -> Generations {
    Generations::for_version(&self.version)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve an asset entry (absolute URL or origin-relative path).
  pub fn resolve(&self, asset: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(asset)
      .map_err(|e| eyre!("Invalid asset URL '{}': {}", asset, e))
  }

  pub fn replay_url(&self) -> Result<Url> {
    Url::parse(&self.queue.replay_url)
      .map_err(|e| eyre!("Invalid replay URL '{}': {}", self.queue.replay_url, e))
  }

  pub fn strategy_rules(&self) -> Result<StrategyRules> {
    Ok(StrategyRules::new(
      self.network_first_patterns.as_slice(),
      self.cache_first_patterns.as_slice(),
    )?)
  }

  /// Resolve every URL and pattern the worker needs.
  pub fn worker_options(&self) -> Result<WorkerOptions> {
    let resolve_all = |assets: &[String]| -> Result<Vec<Url>> {
      assets.iter().map(|a| self.resolve(a)).collect()
    };

    Ok(WorkerOptions {
      generations: self.generations(),
      static_assets: resolve_all(&self.static_assets)?,
      dynamic_assets: resolve_all(&self.dynamic_assets)?,
      offline_page: self.resolve(&self.offline_page)?,
      rules: self.strategy_rules()?,
    })
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch.timeout_secs)
  }

  pub fn drain_interval(&self) -> Duration {
    Duration::from_secs(self.queue.drain_interval_secs.max(1))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    match &self.cache.db_path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("cache.db")),
    }
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    match &self.queue.db_path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("queue.db")),
    }
  }
}

/// Get the default data directory.
fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("qrworker"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_shipped_worker() {
    let config = Config::default();
    let generations = config.generations();
    assert_eq!(generations.static_name, "qr-static-v2.0.0");
    assert_eq!(generations.dynamic_name, "qr-dynamic-v2.0.0");
    assert_eq!(config.static_assets.len(), 7);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "version: v3\norigin: https://qr.example.com\nqueue:\n  drain_interval_secs: 60\n",
    )
    .unwrap();
    assert_eq!(config.generations().static_name, "qr-static-v3");
    assert_eq!(config.queue.drain_interval_secs, 60);
    assert_eq!(config.queue.replay_url, "http://localhost:8080/api/qr");
    assert!(config.cache.enabled);
  }

  #[test]
  fn test_resolve_relative_and_absolute_assets() {
    let config = Config::from_yaml("origin: https://qr.example.com/app/\n").unwrap();
    assert_eq!(
      config.resolve("/index.html").unwrap().as_str(),
      "https://qr.example.com/index.html"
    );
    assert_eq!(
      config
        .resolve("https://cdn.jsdelivr.net/npm/jsqr@1.4.0/dist/jsQR.js")
        .unwrap()
        .host_str(),
      Some("cdn.jsdelivr.net")
    );
  }

  #[test]
  fn test_worker_options_resolve_against_origin() {
    let config = Config::from_yaml(
      "origin: https://qr.example.com\nversion: v3\nstatic_assets: ['/', '/app.js']\n",
    )
    .unwrap();
    let options = config.worker_options().unwrap();
    assert_eq!(options.generations.static_name, "qr-static-v3");
    assert_eq!(options.static_assets.len(), 2);
    assert_eq!(options.static_assets[1].as_str(), "https://qr.example.com/app.js");
    assert_eq!(
      options.offline_page.as_str(),
      "https://qr.example.com/offline.html"
    );
  }

  #[test]
  fn test_bad_pattern_fails_validation() {
    let config = Config::from_yaml("cache_first_patterns: ['[']\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qrworker.yaml");
    std::fs::write(&path, "version: v9\ncache:\n  enabled: false\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.version, "v9");
    assert!(!config.cache.enabled);
  }
}
