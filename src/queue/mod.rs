//! Durable queue of writes captured while the API was unreachable.

mod manager;
mod store;

use color_eyre::Result;
use std::future::Future;

use crate::api::types::{SyncRequest, SyncResponse};

pub use manager::{FlushOutcome, MutationQueue};
pub use store::{Action, QueueItem, QueueStore};

/// Remote endpoint that applies a batch of queued writes.
pub trait SyncTransport: Send + Sync + 'static {
  fn sync_batch(&self, request: &SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send;
}
