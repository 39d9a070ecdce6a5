//! Core traits and types for the response cache.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  /// Request body for writes (never part of the cache key)
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      body: None,
    }
  }

  pub fn new(method: &str, url: Url, body: Option<Vec<u8>>) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      body,
    }
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Stable, fixed-length key identifying this exact request in a cache.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as seen by the requesting page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body: body.into(),
    }
  }

  /// 2xx status
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Trait for named cache backends.
///
/// Caches are created on demand and hold at most one response per request key.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named cache if it does not exist yet.
  fn open_cache(&self, name: &str) -> Result<()>;

  /// Names of every existing cache.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and its entries. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Store a response for a request, replacing any previous one.
  fn put(&self, cache: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up the response stored for this exact request.
  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<Response>>;

  /// URLs stored in a cache, in insertion order.
  fn urls(&self, cache: &str) -> Result<Vec<String>>;
}
