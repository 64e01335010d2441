//! Core types for cached responses.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::http::{Request, Response};

/// Normalized cache key for a GET request: `"GET <absolute url>"` with the fragment removed.
///
/// Only GET requests produce a key, so nothing else can ever be stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn for_request(request: &Request) -> Option<Self> {
    if !request.method.is_get() {
      return None;
    }
    let mut url = request.url.clone();
    url.set_fragment(None);
    Some(Self(format!("GET {}", url)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A response held by a cache generation.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Where to look when matching a request against the registry.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
  /// A single named generation
  Generation(&'a str),
  /// Every generation, most recently opened first
  Any,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// A stored response, served without (or instead of) the network
  Cache,
  /// The designated offline page, served for a failed navigation
  OfflineFallback,
  /// Request was not intercepted and went straight to the network
  Passthrough,
}

/// Response handed back to the caller of the interceptor.
#[derive(Debug, Clone)]
pub struct ServedResponse {
  pub response: Response,
  pub source: ResponseSource,
}

impl ServedResponse {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline_fallback(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::OfflineFallback,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Passthrough,
    }
  }
}
