//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::{CachedResponse, RequestKey, Scope};
use crate::error::{Result, WorkerError};
use crate::http::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations. Each generation maps a
/// [`RequestKey`] to exactly one response; writing a key again replaces it.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet. Idempotent.
  fn open(&self, generation: &str) -> Result<()>;

  /// Store a response under `key`, overwriting any previous entry.
  ///
  /// Responses outside the 2xx class are silently discarded.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Find a stored response in one generation or across all of them.
  fn lookup(&self, scope: Scope<'_>, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// All generation names, most recently opened first.
  fn names(&self) -> Result<Vec<String>>;

  /// Delete a generation and its entries. Returns false if it did not exist.
  fn delete(&self, generation: &str) -> Result<bool>;

  /// Sum of body lengths stored in one generation. Unknown generations are `NotFound`.
  fn size_of(&self, generation: &str) -> Result<u64>;

  /// Delete every generation not named in `keep`.
  ///
  /// Best-effort: a failed deletion is logged and the remaining generations
  /// are still processed. Returns the names that were deleted.
  fn delete_all_except(&self, keep: &[&str]) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.names()? {
      if keep.contains(&name.as_str()) {
        continue;
      }
      match self.delete(&name) {
        Ok(_) => deleted.push(name),
        Err(e) => warn!(generation = %name, error = %e, "Failed to delete old cache generation"),
      }
    }
    Ok(deleted)
  }

  /// Sum of body lengths across every generation.
  ///
  /// A generation deleted while the sizes are summed counts as empty.
  fn total_size(&self) -> Result<u64> {
    let mut total = 0;
    for name in self.names()? {
      match self.size_of(&name) {
        Ok(size) => total += size,
        Err(WorkerError::NotFound(_)) => {
          debug!(generation = %name, "Generation vanished while sizing");
        }
        Err(e) => return Err(e),
      }
    }
    Ok(total)
  }

  /// Delete every generation. Returns how many were removed.
  fn clear_all(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.names()? {
      if self.delete(&name)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _generation: &str) -> Result<()> {
    Ok(())
  }

  fn put(&self, _generation: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn lookup(&self, _scope: Scope<'_>, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete(&self, _generation: &str) -> Result<bool> {
    Ok(false)
  }

  fn size_of(&self, generation: &str) -> Result<u64> {
    Err(WorkerError::NotFound(generation.to_string()))
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| WorkerError::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      WorkerError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Volatile storage that disappears with the connection.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| WorkerError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| WorkerError::Storage(format!("Failed to run cache migrations: {}", e)))
  }

  fn ensure_generation(conn: &Connection, generation: &str) -> Result<()> {
    conn.execute(
      "INSERT OR IGNORE INTO generations (name, opened_seq)
       VALUES (?1, (SELECT COALESCE(MAX(opened_seq), 0) + 1 FROM generations))",
      params![generation],
    )?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache generations, in the order they were first opened
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    opened_seq INTEGER NOT NULL
);

-- One stored response per request key per generation
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;
    Self::ensure_generation(&conn, generation)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    if !response.is_success() {
      debug!(%key, status = response.status, "Not caching non-success response");
      return Ok(());
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| WorkerError::Storage(format!("Failed to serialize headers: {}", e)))?;

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    Self::ensure_generation(&tx, generation)?;
    tx.execute(
      "INSERT OR REPLACE INTO entries (generation, key_hash, request_key, status, headers, body, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        generation,
        key.digest(),
        key.as_str(),
        response.status,
        headers,
        &response.body[..],
        Utc::now().to_rfc3339(),
      ],
    )?;
    tx.commit()?;

    Ok(())
  }

  fn lookup(&self, scope: Scope<'_>, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let digest = key.digest();

    let row = match scope {
      Scope::Generation(name) => conn
        .query_row(
          "SELECT status, headers, body, cached_at FROM entries
           WHERE generation = ?1 AND key_hash = ?2",
          params![name, digest],
          read_entry,
        )
        .optional()?,
      Scope::Any => conn
        .query_row(
          "SELECT e.status, e.headers, e.body, e.cached_at FROM entries e
           INNER JOIN generations g ON g.name = e.generation
           WHERE e.key_hash = ?1
           ORDER BY g.opened_seq DESC
           LIMIT 1",
          params![digest],
          read_entry,
        )
        .optional()?,
    };

    row.map(decode_entry).transpose()
  }

  fn names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY opened_seq DESC")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE generation = ?1", params![generation])?;
    let removed = tx.execute("DELETE FROM generations WHERE name = ?1", params![generation])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn size_of(&self, generation: &str) -> Result<u64> {
    let conn = self.conn()?;
    let exists: Option<String> = conn
      .query_row(
        "SELECT name FROM generations WHERE name = ?1",
        params![generation],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Err(WorkerError::NotFound(generation.to_string()));
    }

    let size: i64 = conn.query_row(
      "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM entries WHERE generation = ?1",
      params![generation],
      |row| row.get(0),
    )?;
    Ok(size as u64)
  }
}

type RawEntry = (u16, String, Vec<u8>, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_entry((status, headers, body, cached_at): RawEntry) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| WorkerError::Storage(format!("Failed to deserialize headers: {}", e)))?;
  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body: body.into(),
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| WorkerError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("https://example.com").unwrap().join(path).unwrap();
    RequestKey::for_request(&Request::get(url)).unwrap()
  }

  #[test]
  fn test_open_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("static-v1").unwrap();
    storage.open("static-v1").unwrap();
    assert_eq!(storage.names().unwrap(), vec!["static-v1".to_string()]);
  }

  #[test]
  fn test_put_overwrites_existing_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("dynamic-v1", &key("/a.js"), &Response::new(200, "one")).unwrap();
    storage.put("dynamic-v1", &key("/a.js"), &Response::new(200, "two")).unwrap();

    let hit = storage
      .lookup(Scope::Generation("dynamic-v1"), &key("/a.js"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body.as_ref(), b"two");
    assert_eq!(storage.size_of("dynamic-v1").unwrap(), 3);
  }

  #[test]
  fn test_put_ignores_non_success() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("dynamic-v1", &key("/gone"), &Response::new(404, "nope")).unwrap();
    assert!(storage.lookup(Scope::Any, &key("/gone")).unwrap().is_none());
  }

  #[test]
  fn test_headers_round_trip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let resp = Response::new(200, "body{}").with_header("Content-Type", "text/css");
    storage.put("static-v1", &key("/style.css"), &resp).unwrap();

    let hit = storage.lookup(Scope::Any, &key("/style.css")).unwrap().unwrap();
    assert_eq!(hit.response, resp);
  }

  #[test]
  fn test_any_prefers_most_recently_opened() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("static-v1").unwrap();
    storage.open("dynamic-v1").unwrap();
    storage.put("static-v1", &key("/logo.png"), &Response::new(200, "old")).unwrap();
    storage.put("dynamic-v1", &key("/logo.png"), &Response::new(200, "new")).unwrap();

    let hit = storage.lookup(Scope::Any, &key("/logo.png")).unwrap().unwrap();
    assert_eq!(hit.response.body.as_ref(), b"new");
  }

  #[test]
  fn test_delete_all_except_keeps_current() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v1", &key("/"), &Response::new(200, "v1")).unwrap();
    storage.open("static-v2").unwrap();
    storage.open("dynamic-v2").unwrap();

    let deleted = storage.delete_all_except(&["static-v2", "dynamic-v2"]).unwrap();
    assert_eq!(deleted, vec!["static-v1".to_string()]);

    let names = storage.names().unwrap();
    assert!(names.contains(&"static-v2".to_string()));
    assert!(!names.contains(&"static-v1".to_string()));
    assert!(storage.lookup(Scope::Any, &key("/")).unwrap().is_none());
  }

  #[test]
  fn test_total_size_and_clear() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("static-v1", &key("/"), &Response::new(200, "12345")).unwrap();
    storage.put("dynamic-v1", &key("/x.js"), &Response::new(200, "123")).unwrap();
    assert_eq!(storage.total_size().unwrap(), 8);

    assert_eq!(storage.clear_all().unwrap(), 2);
    assert!(storage.names().unwrap().is_empty());
    assert_eq!(storage.total_size().unwrap(), 0);
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("static-v1", &key("/index.html"), &Response::new(200, "<html>")).unwrap();
    }
    let storage = SqliteStorage::open_at(&path).unwrap();
    assert!(storage.lookup(Scope::Generation("static-v1"), &key("/index.html")).unwrap().is_some());
  }

  #[test]
  fn test_size_of_unknown_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("empty-v1").unwrap();
    assert_eq!(storage.size_of("empty-v1").unwrap(), 0);
    assert!(matches!(
      storage.size_of("missing-v1"),
      Err(WorkerError::NotFound(_))
    ));
  }

  /// Lists a generation that is already gone by the time it is sized.
  struct VanishingStorage {
    inner: SqliteStorage,
  }

  impl CacheStorage for VanishingStorage {
    fn open(&self, generation: &str) -> Result<()> {
      self.inner.open(generation)
    }

    fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
      self.inner.put(generation, key, response)
    }

    fn lookup(&self, scope: Scope<'_>, key: &RequestKey) -> Result<Option<CachedResponse>> {
      self.inner.lookup(scope, key)
    }

    fn names(&self) -> Result<Vec<String>> {
      let mut names = self.inner.names()?;
      names.push("dynamic-v0".to_string());
      Ok(names)
    }

    fn delete(&self, generation: &str) -> Result<bool> {
      self.inner.delete(generation)
    }

    fn size_of(&self, generation: &str) -> Result<u64> {
      self.inner.size_of(generation)
    }
  }

  #[test]
  fn test_total_size_skips_generation_deleted_mid_sum() {
    let storage = VanishingStorage {
      inner: SqliteStorage::open_in_memory().unwrap(),
    };
    storage.put("static-v1", &key("/"), &Response::new(200, "12345")).unwrap();
    assert_eq!(storage.total_size().unwrap(), 5);
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.put("static-v1", &key("/"), &Response::new(200, "x")).unwrap();
    assert!(storage.lookup(Scope::Any, &key("/")).unwrap().is_none());
    assert_eq!(storage.total_size().unwrap(), 0);
  }
}
