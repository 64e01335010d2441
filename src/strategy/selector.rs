//! Classifies outbound requests into a handling strategy.

use regex::Regex;
use url::Url;

use crate::error::{Result, WorkerError};
use crate::http::Method;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Not intercepted; the request goes to the network untouched
  Skip,
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

/// Telemetry and API traffic, which must never be served stale.
pub const DEFAULT_NETWORK_FIRST: &[&str] = &[r"api\.", r"analytics\.", r"gtag"];

/// Static assets and known font/CDN hosts.
pub const DEFAULT_CACHE_FIRST: &[&str] = &[
  r"\.(?:png|jpg|jpeg|svg|gif|webp)$",
  r"\.(?:js|css)$",
  r"fonts\.googleapis\.com",
  r"cdnjs\.cloudflare\.com",
];

/// Ordered (pattern, strategy) rules. First match wins; no match means
/// stale-while-revalidate.
#[derive(Debug, Clone)]
pub struct StrategyRules {
  rules: Vec<(Regex, Strategy)>,
}

impl StrategyRules {
  /// Build rules from pattern lists. Network-first patterns are checked first.
  pub fn new<S: AsRef<str>>(network_first: &[S], cache_first: &[S]) -> Result<Self> {
    let mut rules = Vec::with_capacity(network_first.len() + cache_first.len());
    for (patterns, strategy) in [
      (network_first, Strategy::NetworkFirst),
      (cache_first, Strategy::CacheFirst),
    ] {
      for pattern in patterns {
        let regex = Regex::new(pattern.as_ref()).map_err(|e| {
          WorkerError::Config(format!("Invalid pattern '{}': {}", pattern.as_ref(), e))
        })?;
        rules.push((regex, strategy));
      }
    }
    Ok(Self { rules })
  }

  pub fn classify(&self, url: &Url, method: &Method) -> Strategy {
    if !method.is_get() || !matches!(url.scheme(), "http" | "https") {
      return Strategy::Skip;
    }

    self
      .rules
      .iter()
      .find(|(regex, _)| regex.is_match(url.as_str()))
      .map(|(_, strategy)| *strategy)
      .unwrap_or(Strategy::StaleWhileRevalidate)
  }
}

impl Default for StrategyRules {
  fn default() -> Self {
    // Built-in patterns are known to compile.
    Self::new(DEFAULT_NETWORK_FIRST, DEFAULT_CACHE_FIRST).unwrap_or(Self { rules: Vec::new() })
  }
}
