//! Wire types exchanged with the ERP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{Action, QueueItem};

/// One queued write as submitted to the bulk sync endpoint (no timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
  pub entity_type: String,
  pub action: Action,
  pub payload: Value,
}

impl From<&QueueItem> for SyncItem {
  fn from(item: &QueueItem) -> Self {
    Self {
      entity_type: item.entity_type.clone(),
      action: item.action,
      payload: item.payload.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
  pub sync_items: Vec<SyncItem>,
}

/// Per-item results, one per submitted item, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
  #[serde(default)]
  pub results: Vec<SyncItemResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncItemResult {
  #[serde(default)]
  pub result: SyncOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
  #[serde(default)]
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Value>,
}

impl SyncResponse {
  /// Number of items the server reported as applied.
  ///
  /// Callers trim this many items from the front of the queue, which
  /// assumes successes form a prefix of the submitted batch.
  pub fn confirmed_count(&self) -> usize {
    self.results.iter().filter(|r| r.result.success).count()
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyResponse {
  pub public_key: String,
}

/// What the server needs to deliver pushes to this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSubscriptionRecord {
  /// Platform subscription handle, forwarded untouched
  pub subscription: Value,
  pub device_type: String,
  pub device_info: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_sync_request_shape() {
    let item = QueueItem {
      entity_type: "weighing".to_string(),
      action: Action::Update,
      payload: json!({ "id": 4, "net_kg": 1200 }),
      timestamp: 42,
    };
    let request = SyncRequest {
      sync_items: vec![SyncItem::from(&item)],
    };

    assert_eq!(
      serde_json::to_value(&request).unwrap(),
      json!({ "sync_items": [{ "entity_type": "weighing", "action": "update", "payload": { "id": 4, "net_kg": 1200 } }] })
    );
  }

  #[test]
  fn test_confirmed_count_tolerates_missing_fields() {
    let response: SyncResponse = serde_json::from_value(json!({
      "results": [
        { "result": { "success": true, "id": 10 } },
        { "result": { "success": false, "error": "invalid" } },
        { "result": {} },
        { "result": { "success": true } }
      ]
    }))
    .unwrap();

    assert_eq!(response.confirmed_count(), 2);

    let empty: SyncResponse = serde_json::from_value(json!({})).unwrap();
    assert_eq!(empty.confirmed_count(), 0);
  }
}
