//! Per-request routing between the network and the cache.

use serde_json::json;

use crate::cache::{Request, Response};

/// Body of every synthetic offline response
pub const OFFLINE_MESSAGE: &str = "Mode hors ligne";

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Network first, cache on failure, synthetic JSON as a last resort.
  /// Successful responses refresh the cache.
  RemoteData,
  /// Cache first, network on miss, synthetic 503 as a last resort.
  /// Network responses after a miss are not cached.
  StaticAsset,
}

impl Policy {
  /// Classify a request by whether its URL carries the API marker.
  pub fn for_request(request: &Request, api_marker: &str) -> Self {
    if request.url.as_str().contains(api_marker) {
      Policy::RemoteData
    } else {
      Policy::StaticAsset
    }
  }
}

/// Structurally valid JSON handed to API callers when nothing else is available.
pub fn offline_api_response() -> Response {
  let body = json!({ "error": OFFLINE_MESSAGE, "offline": true });
  Response::new(200, Some("application/json"), body.to_string())
}

pub fn offline_asset_response() -> Response {
  Response::new(503, Some("text/plain"), OFFLINE_MESSAGE)
}
