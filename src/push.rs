//! Push notifications: turning server pushes into user notifications, and
//! registering this device for pushes.

use color_eyre::Result;
use serde_json::{Map, Value};
use std::future::Future;
use tracing::{info, warn};

use crate::api::types::PushSubscriptionRecord;

pub const DEFAULT_TITLE: &str = "New notification";
pub const DEFAULT_BODY: &str = "You have a new notification";
pub const DEFAULT_CLICK_URL: &str = "/";

/// Result of reading a push payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadParse {
  Parsed(Value),
  /// Missing or malformed payload; handled as an empty object
  Defaulted,
}

impl PayloadParse {
  pub fn parse(data: Option<&[u8]>) -> Self {
    let Some(bytes) = data else {
      return PayloadParse::Defaulted;
    };
    match serde_json::from_slice(bytes) {
      Ok(value) => PayloadParse::Parsed(value),
      Err(e) => {
        warn!(error = %e, "ignoring malformed push payload");
        PayloadParse::Defaulted
      }
    }
  }

  pub fn into_value(self) -> Value {
    match self {
      PayloadParse::Parsed(value) => value,
      PayloadParse::Defaulted => Value::Object(Map::new()),
    }
  }
}

/// A notification ready to show to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  /// The full original payload
  pub data: Value,
}

impl Notification {
  pub fn from_payload(payload: Value) -> Self {
    let text = |key: &str| payload.get(key).and_then(Value::as_str).map(String::from);

    Self {
      title: text("title").unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: text("body").unwrap_or_else(|| DEFAULT_BODY.to_string()),
      icon: text("icon"),
      data: payload,
    }
  }

  /// Where a click on this notification leads.
  pub fn click_url(&self) -> &str {
    self
      .data
      .get("url")
      .and_then(Value::as_str)
      .unwrap_or(DEFAULT_CLICK_URL)
  }
}

/// Where notifications are displayed.
pub trait NotificationSurface: Send + Sync {
  fn show(&self, notification: &Notification);

  fn close(&self, notification: &Notification);

  fn open_window(&self, url: &str);
}

/// Handle a received push message. Never fails.
pub fn on_push<N: NotificationSurface>(surface: &N, data: Option<&[u8]>) -> Notification {
  let notification = Notification::from_payload(PayloadParse::parse(data).into_value());
  surface.show(&notification);
  notification
}

/// Handle a click: close the notification and open its target.
pub fn on_notification_click<N: NotificationSurface>(surface: &N, notification: &Notification) {
  surface.close(notification);
  surface.open_window(notification.click_url());
}

/// Platform side of push: permission and subscription handles.
pub trait PushPlatform: Send + Sync {
  /// Ask for notification permission. Returns whether it was granted.
  fn request_permission(&self) -> impl Future<Output = Result<bool>> + Send;

  fn existing_subscription(&self) -> impl Future<Output = Result<Option<Value>>> + Send;

  fn subscribe(&self, public_key: &str) -> impl Future<Output = Result<Value>> + Send;
}

/// Server side of push registration.
pub trait PushServer: Send + Sync {
  fn public_key(&self) -> impl Future<Output = Result<String>> + Send;

  fn register_subscription(
    &self,
    record: &PushSubscriptionRecord,
  ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushRegistration {
  Registered(PushSubscriptionRecord),
  /// Permission refused; shown as a dismissible warning
  PermissionDenied,
}

/// Subscribe this device and forward the subscription to the server.
///
/// An existing platform subscription is reused.
pub async fn register_device<P: PushPlatform, S: PushServer>(
  platform: &P,
  server: &S,
  device_type: &str,
  device_info: &str,
) -> Result<PushRegistration> {
  if !platform.request_permission().await? {
    warn!("notification permission denied; push disabled");
    return Ok(PushRegistration::PermissionDenied);
  }

  // The public key is only needed to create a subscription
  let subscription = match platform.existing_subscription().await? {
    Some(existing) => existing,
    None => {
      let key = server.public_key().await?;
      platform.subscribe(&key).await?
    }
  };

  let record = PushSubscriptionRecord {
    subscription,
    device_type: device_type.to_string(),
    device_info: device_info.to_string(),
  };
  server.register_subscription(&record).await?;
  info!(device_type, "registered for push notifications");

  Ok(PushRegistration::Registered(record))
}
