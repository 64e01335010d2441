//! Request and response values that flow through the interception layer.
//!
//! Bodies are held as [`Bytes`], so duplicating a response for the cache is a
//! reference-count bump rather than a second read of the network stream.

use bytes::Bytes;
use std::fmt;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
  Get,
  Other(String),
}

impl Method {
  pub fn parse(s: &str) -> Self {
    if s.eq_ignore_ascii_case("GET") {
      Method::Get
    } else {
      Method::Other(s.to_ascii_uppercase())
    }
  }

  pub fn is_get(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Method::Get => f.write_str("GET"),
      Method::Other(m) => f.write_str(m),
    }
  }
}

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// A navigable page; eligible for the offline fallback page.
  Document,
  #[default]
  Other,
}

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      destination: Destination::Other,
    }
  }

  pub fn document(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      destination: Destination::Document,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Status class 2xx.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}
