//! Named, versioned cache generations.
//!
//! This module provides the response cache used by the interceptor:
//! - One response per GET request key per generation, last write wins
//! - Generations are opened lazily and deleted wholesale on activation
//! - Sizes are reported for diagnostics only; nothing is evicted automatically

mod entry;
mod storage;

pub use entry::{CachedResponse, RequestKey, ResponseSource, Scope, ServedResponse};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};

/// The generation names owned by the running worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
  /// Pre-warmed at install, refreshed by stale-while-revalidate
  pub static_name: String,
  /// Filled lazily by cache-first and network-first
  pub dynamic_name: String,
}

impl Generations {
  pub fn for_version(version: &str) -> Self {
    Self {
      static_name: format!("qr-static-{}", version),
      dynamic_name: format!("qr-dynamic-{}", version),
    }
  }

  /// Names that survive activation cleanup.
  pub fn current(&self) -> [&str; 2] {
    [self.static_name.as_str(), self.dynamic_name.as_str()]
  }
}
