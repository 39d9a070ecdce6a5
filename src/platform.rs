//! Host-side push pieces for running outside a browser.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::config::PushConfig;
use crate::db::KeyValueStore;
use crate::push::{Notification, NotificationSurface, PushPlatform};

/// Key holding this host's push subscription
pub const SUBSCRIPTION_KEY: &str = "push.subscription";

/// Prints notifications to stdout.
pub struct TerminalSurface;

impl NotificationSurface for TerminalSurface {
  fn show(&self, notification: &Notification) {
    info!(title = %notification.title, "showing notification");
    match &notification.icon {
      Some(icon) => println!("[{}] {}\n  {}", icon, notification.title, notification.body),
      None => println!("{}\n  {}", notification.title, notification.body),
    }
  }

  fn close(&self, notification: &Notification) {
    info!(title = %notification.title, "closing notification");
  }

  fn open_window(&self, url: &str) {
    println!("open {}", url);
  }
}

/// Push platform backed by the state database.
///
/// Permission comes from configuration. A subscription is created once
/// against the configured push endpoint and reused afterwards.
pub struct LocalPushPlatform<K> {
  kv: Arc<K>,
  config: PushConfig,
}

impl<K: KeyValueStore> LocalPushPlatform<K> {
  pub fn new(kv: Arc<K>, config: PushConfig) -> Self {
    Self { kv, config }
  }

  fn stored(&self) -> Result<Option<Value>> {
    match self.kv.get(SUBSCRIPTION_KEY)? {
      Some(json) => serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| eyre!("Failed to parse stored push subscription: {}", e)),
      None => Ok(None),
    }
  }

  fn create(&self, public_key: &str) -> Result<Value> {
    let endpoint = self
      .config
      .endpoint
      .as_deref()
      .ok_or_else(|| eyre!("push.endpoint is not configured"))?;

    let subscription = json!({
      "endpoint": endpoint,
      "keys": { "application_server_key": public_key },
    });
    self.kv.set(SUBSCRIPTION_KEY, &subscription.to_string())?;
    Ok(subscription)
  }
}

impl<K: KeyValueStore> PushPlatform for LocalPushPlatform<K> {
  fn request_permission(&self) -> impl Future<Output = Result<bool>> + Send {
    let granted = self.config.enabled;
    async move { Ok(granted) }
  }

  fn existing_subscription(&self) -> impl Future<Output = Result<Option<Value>>> + Send {
    let stored = self.stored();
    async move { stored }
  }

  fn subscribe(&self, public_key: &str) -> impl Future<Output = Result<Value>> + Send {
    let created = self.create(public_key);
    async move { created }
  }
}
