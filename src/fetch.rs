//! Network access for the interceptor and the queue replayer.

use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;
use url::Url;

use crate::error::{Result, WorkerError};
use crate::http::{Request, Response};

/// Something that can put a request on the wire.
///
/// Only transport failures are errors; a 404 or 500 is still an `Ok` response.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;

  /// POST a JSON document. Used to replay deferred actions.
  async fn post_json(&self, url: &Url, body: &serde_json::Value) -> Result<Response>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("qrworker/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| WorkerError::Config(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }

  async fn buffer(response: reqwest::Response) -> Result<Response> {
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?;

    Ok(
      headers
        .into_iter()
        .fold(Response::new(status, body), |resp, (name, value)| {
          resp.with_header(name, value)
        }),
    )
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    trace!(method = %request.method, url = %request.url, "fetch");
    let method = reqwest::Method::from_bytes(request.method.to_string().as_bytes())
      .map_err(|e| WorkerError::Validation(format!("Bad method {}: {}", request.method, e)))?;
    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await?;
    Self::buffer(response).await
  }

  async fn post_json(&self, url: &Url, body: &serde_json::Value) -> Result<Response> {
    trace!(%url, "post");
    let response = self.client.post(url.clone()).json(body).send().await?;
    Self::buffer(response).await
  }
}
