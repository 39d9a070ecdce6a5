//! Durable slot holding the serialized mutation queue.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::db::KeyValueStore;

/// Storage key of the JSON-serialized queue array
pub const QUEUE_KEY: &str = "offline_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Delete,
}

impl std::fmt::Display for Action {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
    };
    f.write_str(name)
  }
}

impl std::str::FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, String> {
    match s.to_ascii_lowercase().as_str() {
      "create" => Ok(Action::Create),
      "update" => Ok(Action::Update),
      "delete" => Ok(Action::Delete),
      other => Err(format!("unknown action '{}' (expected create, update or delete)", other)),
    }
  }
}

/// A write captured while the remote API was unreachable.
///
/// Items are never modified after creation; they are appended and later
/// removed from the front once the server confirms them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub entity_type: String,
  pub action: Action,
  pub payload: Value,
  /// Epoch milliseconds at enqueue time
  pub timestamp: i64,
}

/// The whole queue lives in a single key/value slot.
pub struct QueueStore<K> {
  kv: Arc<K>,
}

impl<K: KeyValueStore> QueueStore<K> {
  pub fn new(kv: Arc<K>) -> Self {
    Self { kv }
  }

  pub fn load(&self) -> Result<Vec<QueueItem>> {
    match self.kv.get(QUEUE_KEY)? {
      Some(json) => {
        serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse stored queue: {}", e))
      }
      None => Ok(Vec::new()),
    }
  }

  pub fn save(&self, items: &[QueueItem]) -> Result<()> {
    let json =
      serde_json::to_string(items).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;
    self.kv.set(QUEUE_KEY, &json)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use serde_json::json;

  #[test]
  fn test_empty_store_loads_empty_queue() {
    let store = QueueStore::new(Arc::new(Database::open_in_memory().unwrap()));
    assert!(store.load().unwrap().is_empty());
  }

  #[test]
  fn test_stored_format() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = QueueStore::new(Arc::clone(&db));
    let item = QueueItem {
      entity_type: "note".to_string(),
      action: Action::Create,
      payload: json!({ "x": 1 }),
      timestamp: 1_700_000_000_000,
    };

    store.save(std::slice::from_ref(&item)).unwrap();

    let raw: Value = serde_json::from_str(&db.get(QUEUE_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(
      raw,
      json!([{ "entity_type": "note", "action": "create", "payload": { "x": 1 }, "timestamp": 1_700_000_000_000i64 }])
    );
    assert_eq!(store.load().unwrap(), vec![item]);
  }

  #[test]
  fn test_corrupt_slot_is_an_error() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.set(QUEUE_KEY, "not json").unwrap();

    assert!(QueueStore::new(db).load().is_err());
  }

  #[test]
  fn test_parse_action() {
    assert_eq!("Create".parse::<Action>().unwrap(), Action::Create);
    assert_eq!("delete".parse::<Action>().unwrap(), Action::Delete);
    assert!("upsert".parse::<Action>().is_err());
  }
}
