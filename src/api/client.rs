use color_eyre::{eyre::eyre, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::api::types::{PublicKeyResponse, PushSubscriptionRecord, SyncRequest, SyncResponse};
use crate::api::writes::WriteSender;
use crate::cache::{Request, Response};
use crate::config::Config;
use crate::proxy::Network;
use crate::push::PushServer;
use crate::queue::{Action, SyncTransport};

/// Outcome of sending a single write to the API.
#[derive(Debug)]
pub enum WriteAttempt {
  Applied(Value),
  /// The server answered with a non-success status
  Rejected { status: u16, body: String },
  /// The request never completed
  Unreachable(String),
}

/// ERP API client wrapper
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
  sync_path: String,
  push_key_path: String,
  push_subscribe_path: String,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .user_agent(concat!("offline-relay/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      token: Config::get_api_token(),
      sync_path: config.api.sync_path.clone(),
      push_key_path: config.api.push_key_path.clone(),
      push_subscribe_path: config.api.push_subscribe_path.clone(),
    })
  }

  pub fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid API path '{}': {}", path, e))
  }

  fn authorize(&self, builder: reqwest::RequestBuilder, url: &Url) -> reqwest::RequestBuilder {
    // Credentials only ever go to our own origin
    match &self.token {
      Some(token) if url.origin() == self.base.origin() => {
        builder.header(AUTHORIZATION, format!("Bearer {}", token))
      }
      _ => builder,
    }
  }

  /// Submit a batch of queued writes to the bulk sync endpoint
  pub async fn submit_sync_batch(&self, request: &SyncRequest) -> Result<SyncResponse> {
    let url = self.endpoint(&self.sync_path)?;

    let response = self
      .authorize(self.http.post(url.clone()), &url)
      .json(request)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach sync endpoint: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Sync request rejected: {}", e))?;

    response
      .json::<SyncResponse>()
      .await
      .map_err(|e| eyre!("Failed to parse sync response: {}", e))
  }

  /// Get the server's public key for push subscriptions
  pub async fn push_public_key(&self) -> Result<String> {
    let url = self.endpoint(&self.push_key_path)?;

    let response: PublicKeyResponse = self
      .authorize(self.http.get(url.clone()), &url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch push public key: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Push public key request rejected: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse push public key: {}", e))?;

    Ok(response.public_key)
  }

  /// Forward a push subscription to the server
  pub async fn register_push_subscription(&self, record: &PushSubscriptionRecord) -> Result<()> {
    let url = self.endpoint(&self.push_subscribe_path)?;

    self
      .authorize(self.http.post(url.clone()), &url)
      .json(record)
      .send()
      .await
      .map_err(|e| eyre!("Failed to register push subscription: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Push subscription rejected: {}", e))?;

    Ok(())
  }

  /// Send one write directly, without queueing
  pub async fn attempt_write(&self, action: Action, path: &str, payload: &Value) -> WriteAttempt {
    let url = match self.endpoint(path) {
      Ok(url) => url,
      Err(e) => {
        return WriteAttempt::Rejected {
          status: 0,
          body: e.to_string(),
        }
      }
    };
    let builder = match action {
      Action::Create => self.http.post(url.clone()),
      Action::Update => self.http.put(url.clone()),
      Action::Delete => self.http.delete(url.clone()),
    };

    let response = match self.authorize(builder, &url).json(payload).send().await {
      Ok(response) => response,
      Err(e) => return WriteAttempt::Unreachable(e.to_string()),
    };

    let status = response.status();
    let body = match response.text().await {
      Ok(body) => body,
      Err(e) => return WriteAttempt::Unreachable(e.to_string()),
    };

    if !status.is_success() {
      return WriteAttempt::Rejected {
        status: status.as_u16(),
        body,
      };
    }

    // Empty bodies (204) are reported as null
    WriteAttempt::Applied(serde_json::from_str(&body).unwrap_or(Value::Null))
  }

  /// Perform a raw request and capture the whole response
  pub async fn execute(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", request.method, e))?;

    let mut builder = self.authorize(
      self.http.request(method, request.url.clone()),
      &request.url,
    );
    if let Some(body) = &request.body {
      builder = builder
        .header(CONTENT_TYPE, "application/json")
        .body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?;

    Ok(Response {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

impl Network for ApiClient {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    self.execute(request)
  }
}

impl SyncTransport for ApiClient {
  fn sync_batch(&self, request: &SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send {
    self.submit_sync_batch(request)
  }
}

impl PushServer for ApiClient {
  fn public_key(&self) -> impl Future<Output = Result<String>> + Send {
    self.push_public_key()
  }

  fn register_subscription(
    &self,
    record: &PushSubscriptionRecord,
  ) -> impl Future<Output = Result<()>> + Send {
    self.register_push_subscription(record)
  }
}

impl WriteSender for ApiClient {
  fn send_write(
    &self,
    action: Action,
    path: &str,
    payload: &Value,
  ) -> impl Future<Output = WriteAttempt> + Send {
    self.attempt_write(action, path, payload)
  }
}
