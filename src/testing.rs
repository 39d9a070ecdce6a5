//! Test doubles shared by module tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::cache::{Request, Response};
use crate::proxy::{Network, ProxySettings};

pub const ORIGIN: &str = "https://erp.test";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn settings() -> ProxySettings {
  ProxySettings {
    origin: Url::parse(ORIGIN).unwrap(),
    cache_prefix: "erp-cache".to_string(),
    api_marker: "/api/".to_string(),
    precache: vec![
      "/".to_string(),
      "/index.html".to_string(),
      "/manifest.json".to_string(),
    ],
    skip_waiting_on_install: false,
    version_url: Some("/version.json".to_string()),
  }
}

/// Register the default precache manifest on a fake network.
pub fn serve_precache(network: &FakeNetwork) {
  network.route(&url("/").to_string(), Response::new(200, Some("text/html"), b"<html>root</html>".to_vec()));
  network.route(
    &url("/index.html").to_string(),
    Response::new(200, Some("text/html"), b"<html>index</html>".to_vec()),
  );
  network.route(
    &url("/manifest.json").to_string(),
    Response::new(200, Some("application/json"), b"{}".to_vec()),
  );
}

/// In-memory network with a connectivity switch.
///
/// Unknown URLs answer 404; every call is recorded.
pub struct FakeNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<String, Response>>,
  requests: Mutex<Vec<String>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn route(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

impl Network for FakeNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    self.requests.lock().unwrap().push(request.url.to_string());

    let result = if self.online.load(Ordering::SeqCst) {
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(request.url.as_str())
          .cloned()
          .unwrap_or_else(|| Response::new(404, None, b"not found".to_vec())),
      )
    } else {
      Err(eyre!("connection refused: {}", request.url))
    };

    async move { result }
  }
}

/// Sync transport that confirms every submitted item.
#[derive(Default)]
pub struct AckTransport {
  batches: std::sync::atomic::AtomicUsize,
}

impl AckTransport {
  pub fn batches(&self) -> usize {
    self.batches.load(Ordering::SeqCst)
  }
}

impl crate::queue::SyncTransport for std::sync::Arc<AckTransport> {
  fn sync_batch(
    &self,
    request: &crate::api::types::SyncRequest,
  ) -> impl Future<Output = Result<crate::api::types::SyncResponse>> + Send {
    use crate::api::types::{SyncItemResult, SyncOutcome, SyncResponse};

    self.batches.fetch_add(1, Ordering::SeqCst);
    let results = request
      .sync_items
      .iter()
      .map(|_| SyncItemResult {
        result: SyncOutcome {
          success: true,
          error: None,
        },
      })
      .collect();
    async move { Ok(SyncResponse { results }) }
  }
}
