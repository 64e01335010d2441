//! Fetch/cache interaction policies.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::selector::Strategy;
use crate::cache::{CacheStorage, CachedResponse, Generations, RequestKey, Scope, ServedResponse};
use crate::error::{Result, WorkerError};
use crate::fetch::Fetcher;
use crate::http::{Destination, Request, Response};

/// Runs one strategy per intercepted request against the cache registry.
///
/// Cache reads and writes are best-effort: a storage failure is logged and the
/// request is served as if the cache had missed.
pub struct Executor {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  generations: Generations,
  offline_page: Option<RequestKey>,
  /// Background refreshes started by stale-while-revalidate
  revalidations: Mutex<Vec<JoinHandle<Result<Response>>>>,
}

impl Executor {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    generations: Generations,
  ) -> Self {
    Self {
      storage,
      fetcher,
      generations,
      offline_page: None,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  /// Page served when a navigation fails and nothing else is cached.
  pub fn with_offline_page(mut self, page: &Request) -> Self {
    self.offline_page = RequestKey::for_request(page);
    self
  }

  pub async fn execute(&self, strategy: Strategy, request: &Request) -> Result<ServedResponse> {
    let key = match RequestKey::for_request(request) {
      Some(key) if strategy != Strategy::Skip => key,
      _ => return self.passthrough(request).await,
    };

    match strategy {
      Strategy::CacheFirst => self.cache_first(request, &key).await,
      Strategy::NetworkFirst => self.network_first(request, &key).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, &key).await,
      Strategy::Skip => self.passthrough(request).await,
    }
  }

  async fn passthrough(&self, request: &Request) -> Result<ServedResponse> {
    let response = self.fetcher.fetch(request).await?;
    Ok(ServedResponse::passthrough(response))
  }

  /// Serve from cache when possible; otherwise fetch and store in the dynamic generation.
  ///
  /// The lookup spans every generation, not only the dynamic one, so assets
  /// pre-warmed into the static generation at install are served from there.
  pub async fn cache_first(&self, request: &Request, key: &RequestKey) -> Result<ServedResponse> {
    if let Some(cached) = self.cached(Scope::Any, key) {
      return Ok(ServedResponse::from_cache(cached));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&self.generations.dynamic_name, key, &response);
        }
        Ok(ServedResponse::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache-first failed");
        if request.destination == Destination::Document {
          if let Some(page) = self.offline_page() {
            return Ok(ServedResponse::offline_fallback(page));
          }
        }
        Err(e)
      }
    }
  }

  /// Prefer the network; fall back to any cached copy on transport failure.
  pub async fn network_first(&self, request: &Request, key: &RequestKey) -> Result<ServedResponse> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&self.generations.dynamic_name, key, &response);
        }
        Ok(ServedResponse::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network-first failed");
        match self.cached(Scope::Any, key) {
          Some(cached) => Ok(ServedResponse::from_cache(cached)),
          None => Err(e),
        }
      }
    }
  }

  /// Serve the static-generation copy immediately while refreshing it in the background.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    key: &RequestKey,
  ) -> Result<ServedResponse> {
    let cached = self.cached(Scope::Generation(&self.generations.static_name), key);

    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let generation = self.generations.static_name.clone();
    let request = request.clone();
    let key = key.clone();
    let refresh = tokio::spawn(async move {
      let response = fetcher.fetch(&request).await.map_err(|e| {
        warn!(url = %request.url, error = %e, "Background fetch failed");
        e
      })?;
      if response.is_success() {
        if let Err(e) = storage.put(&generation, &key, &response) {
          warn!(%key, error = %e, "Failed to store revalidated response");
        }
      }
      Ok(response)
    });

    match cached {
      Some(cached) => {
        self.track(refresh);
        Ok(ServedResponse::from_cache(cached))
      }
      None => {
        let response = refresh
          .await
          .map_err(|e| WorkerError::Transport(format!("Fetch task failed: {}", e)))??;
        Ok(ServedResponse::from_network(response))
      }
    }
  }

  /// Wait for every background refresh started so far to finish.
  pub async fn settle(&self) {
    let pending: Vec<_> = match self.revalidations.lock() {
      Ok(mut handles) => handles.drain(..).collect(),
      Err(_) => return,
    };
    for handle in pending {
      let _ = handle.await;
    }
  }

  fn track(&self, handle: JoinHandle<Result<Response>>) {
    if let Ok(mut handles) = self.revalidations.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }

  fn offline_page(&self) -> Option<CachedResponse> {
    let key = self.offline_page.as_ref()?;
    self.cached(Scope::Any, key)
  }

  fn cached(&self, scope: Scope<'_>, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.lookup(scope, key) {
      Ok(hit) => {
        debug!(%key, cached_at = ?hit.as_ref().map(|h| h.cached_at), "cache lookup");
        hit
      }
      Err(e) => {
        warn!(%key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  fn store(&self, generation: &str, key: &RequestKey, response: &Response) {
    if let Err(e) = self.storage.put(generation, key, response) {
      warn!(%key, %generation, error = %e, "Failed to cache response");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::fetch::testing::ScriptedFetcher;
  use url::Url;

  const ORIGIN: &str = "http://localhost:8080";

  struct Harness {
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
    executor: Executor,
  }

  fn harness() -> Harness {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let generations = Generations::for_version("v2");
    storage.open(&generations.static_name).unwrap();
    storage.open(&generations.dynamic_name).unwrap();
    let executor = Executor::new(storage.clone(), fetcher.clone(), generations)
      .with_offline_page(&Request::get(url("/offline.html")));
    Harness {
      storage,
      fetcher,
      executor,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::for_request(&Request::get(url(path))).unwrap()
  }

  #[tokio::test]
  async fn test_cache_first_hit_makes_no_network_call() {
    let h = harness();
    h.storage
      .put("qr-dynamic-v2", &key("/app.js"), &Response::new(200, "cached"))
      .unwrap();

    let served = h
      .executor
      .execute(Strategy::CacheFirst, &Request::get(url("/app.js")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"cached");
    assert_eq!(h.fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_serves_prewarmed_static_asset() {
    let h = harness();
    h.storage
      .put("qr-static-v2", &key("/favicon.svg"), &Response::new(200, "<svg/>"))
      .unwrap();

    let served = h
      .executor
      .execute(Strategy::CacheFirst, &Request::get(url("/favicon.svg")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"<svg/>");
    assert_eq!(h.fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_once_and_stores_in_dynamic() {
    let h = harness();
    h.fetcher
      .respond(url("/style.css").as_str(), Response::new(200, "body{}"));

    let served = h
      .executor
      .execute(Strategy::CacheFirst, &Request::get(url("/style.css")))
      .await
      .unwrap();

    assert_eq!(served.response.status, 200);
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(h.fetcher.calls(), 1);
    let stored = h
      .storage
      .lookup(Scope::Generation("qr-dynamic-v2"), &key("/style.css"))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body.as_ref(), b"body{}");
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let h = harness();
    h.fetcher
      .respond(url("/missing.png").as_str(), Response::new(404, "nope"));

    let served = h
      .executor
      .execute(Strategy::CacheFirst, &Request::get(url("/missing.png")))
      .await
      .unwrap();

    assert_eq!(served.response.status, 404);
    assert!(h.storage.lookup(Scope::Any, &key("/missing.png")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_document_falls_back_to_offline_page() {
    let h = harness();
    h.storage
      .put("qr-static-v2", &key("/offline.html"), &Response::new(200, "offline"))
      .unwrap();

    let served = h
      .executor
      .execute(Strategy::CacheFirst, &Request::document(url("/page.css")))
      .await
      .unwrap();

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.body.as_ref(), b"offline");
  }

  #[tokio::test]
  async fn test_cache_first_subresource_propagates_transport_error() {
    let h = harness();
    h.storage
      .put("qr-static-v2", &key("/offline.html"), &Response::new(200, "offline"))
      .unwrap();

    let err = h
      .executor
      .execute(Strategy::CacheFirst, &Request::get(url("/logo.png")))
      .await
      .unwrap_err();

    assert!(err.is_transport());
  }

  #[tokio::test]
  async fn test_network_first_stores_identical_body() {
    let h = harness();
    let api = "https://api.example.com/v1/stats";
    h.fetcher.respond(api, Response::new(200, "{\"count\":3}"));

    let request = Request::get(Url::parse(api).unwrap());
    let served = h
      .executor
      .execute(Strategy::NetworkFirst, &request)
      .await
      .unwrap();

    let stored = h
      .storage
      .lookup(
        Scope::Generation("qr-dynamic-v2"),
        &RequestKey::for_request(&request).unwrap(),
      )
      .unwrap()
      .unwrap();
    assert_eq!(served.response.body, stored.response.body);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let h = harness();
    let api = "https://api.example.com/v1/stats";
    let request = Request::get(Url::parse(api).unwrap());
    h.storage
      .put(
        "qr-dynamic-v2",
        &RequestKey::for_request(&request).unwrap(),
        &Response::new(200, "old"),
      )
      .unwrap();
    h.fetcher.fail(api);

    let served = h
      .executor
      .execute(Strategy::NetworkFirst, &request)
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body.as_ref(), b"old");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates() {
    let h = harness();
    let request = Request::get(Url::parse("https://api.example.com/none").unwrap());
    let err = h
      .executor
      .execute(Strategy::NetworkFirst, &request)
      .await
      .unwrap_err();
    assert!(err.is_transport());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cached_then_updates() {
    let h = harness();
    h.storage
      .put("qr-static-v2", &key("/"), &Response::new(200, "v1"))
      .unwrap();
    h.fetcher.respond(url("/").as_str(), Response::new(200, "v2"));

    let first = h
      .executor
      .execute(Strategy::StaleWhileRevalidate, &Request::document(url("/")))
      .await
      .unwrap();
    assert_eq!(first.source, ResponseSource::Cache);
    assert_eq!(first.response.body.as_ref(), b"v1");

    h.executor.settle().await;

    let second = h
      .executor
      .execute(Strategy::StaleWhileRevalidate, &Request::document(url("/")))
      .await
      .unwrap();
    assert_eq!(second.response.body.as_ref(), b"v2");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let h = harness();
    h.fetcher
      .respond(url("/index.html").as_str(), Response::new(200, "<html>"));

    let served = h
      .executor
      .execute(Strategy::StaleWhileRevalidate, &Request::document(url("/index.html")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(h
      .storage
      .lookup(Scope::Generation("qr-static-v2"), &key("/index.html"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_and_offline_fails() {
    let h = harness();
    let err = h
      .executor
      .execute(Strategy::StaleWhileRevalidate, &Request::document(url("/about")))
      .await
      .unwrap_err();
    assert!(err.is_transport());
  }

  #[tokio::test]
  async fn test_skip_passes_through() {
    let h = harness();
    h.fetcher.respond(url("/submit").as_str(), Response::new(201, ""));
    let request = Request::get(url("/submit")).with_method(crate::http::Method::parse("POST"));

    let served = h.executor.execute(Strategy::Skip, &request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Passthrough);
    assert!(h.storage.lookup(Scope::Any, &key("/submit")).unwrap().is_none());
  }
}
