//! Offline-aware write path used by every UI save.
//!
//! A write that cannot reach the API is captured by the mutation queue and
//! reported back as the queued-write sentinel error, so call sites can show
//! "saved, will sync later" instead of a failure.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::client::WriteAttempt;
use crate::classify::queued_write_error;
use crate::clock::Clock;
use crate::db::KeyValueStore;
use crate::queue::{Action, MutationQueue, SyncTransport};

/// Sends a single write to the API.
pub trait WriteSender: Send + Sync {
  fn send_write(
    &self,
    action: Action,
    path: &str,
    payload: &Value,
  ) -> impl Future<Output = WriteAttempt> + Send;
}

/// Send a write, or queue it when the API is unreachable.
///
/// Returns the server's answer on success. A rejected write is a genuine
/// error. A queued write is the sentinel error recognised by
/// [`crate::classify::is_queued_write`].
pub async fn submit_write<W, K, T, C>(
  sender: &W,
  queue: &Arc<MutationQueue<K, T, C>>,
  entity_type: &str,
  action: Action,
  path: &str,
  payload: Value,
) -> Result<Value>
where
  W: WriteSender,
  K: KeyValueStore,
  T: SyncTransport,
  C: Clock,
{
  if !queue.is_online() {
    let item = queue.enqueue(entity_type, action, payload);
    return Err(queued_write_error(&format!("{}:{}", entity_type, item.timestamp)));
  }

  match sender.send_write(action, path, &payload).await {
    WriteAttempt::Applied(value) => Ok(value),
    WriteAttempt::Rejected { status, body } => Err(eyre!(
      "{} {} rejected with status {}: {}",
      action,
      entity_type,
      status,
      body
    )),
    WriteAttempt::Unreachable(reason) => {
      debug!(entity_type, %action, %reason, "api unreachable, queueing write");
      let item = queue.enqueue(entity_type, action, payload);
      Err(queued_write_error(&format!("{}:{}", entity_type, item.timestamp)))
    }
  }
}
