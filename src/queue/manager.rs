//! Mutation queue service: captures writes while offline and replays them
//! in one bulk request once the API is reachable.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{Action, QueueItem, QueueStore};
use super::SyncTransport;
use crate::api::types::{SyncItem, SyncRequest};
use crate::clock::Clock;
use crate::db::KeyValueStore;

/// What a call to [`MutationQueue::flush`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
  /// Another flush holds the guard
  AlreadyFlushing,
  Empty,
  Offline,
  Synced {
    submitted: usize,
    confirmed: usize,
    remaining: usize,
  },
  /// The batch request itself failed; the queue is unchanged
  Failed(String),
}

/// Releases the flush flag when dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Durable FIFO of pending writes.
///
/// The in-memory queue is the source of truth for this process and is
/// written through to the store on every change. Two processes sharing
/// one store are not coordinated: the last writer wins.
pub struct MutationQueue<K, T, C> {
  store: QueueStore<K>,
  transport: T,
  clock: C,
  items: Mutex<Vec<QueueItem>>,
  flushing: AtomicBool,
  connectivity: watch::Receiver<bool>,
  listener: Mutex<Option<JoinHandle<()>>>,
  /// Flushes started by `enqueue`
  background: Mutex<Vec<JoinHandle<()>>>,
}

impl<K, T, C> MutationQueue<K, T, C>
where
  K: KeyValueStore,
  T: SyncTransport,
  C: Clock,
{
  /// Load the persisted queue and start flushing on every reconnect.
  ///
  /// Must be called from within a tokio runtime.
  pub fn init(
    clock: C,
    store: QueueStore<K>,
    transport: T,
    connectivity: watch::Receiver<bool>,
  ) -> Arc<Self> {
    let items = store.load().unwrap_or_else(|e| {
      warn!(error = %e, "discarding unreadable offline queue");
      Vec::new()
    });
    if !items.is_empty() {
      info!(pending = items.len(), "restored offline queue");
    }

    let queue = Arc::new(Self {
      store,
      transport,
      clock,
      items: Mutex::new(items),
      flushing: AtomicBool::new(false),
      connectivity: connectivity.clone(),
      listener: Mutex::new(None),
      background: Mutex::new(Vec::new()),
    });

    let weak = Arc::downgrade(&queue);
    let mut rx = connectivity;
    let listener = tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !online {
          continue;
        }
        let Some(queue) = weak.upgrade() else {
          break;
        };
        debug!("connectivity restored, flushing offline queue");
        queue.flush().await;
      }
    });
    *queue.listener() = Some(listener);

    queue
  }

  /// Stop reacting to connectivity changes.
  pub fn dispose(&self) {
    if let Some(listener) = self.listener().take() {
      listener.abort();
    }
  }

  fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    self.listener.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    self.background.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Wait for flushes started by `enqueue` to finish.
  pub async fn settle(&self) {
    let tasks = std::mem::take(&mut *self.background());
    for task in tasks {
      let _ = task.await;
    }
  }

  fn items(&self) -> MutexGuard<'_, Vec<QueueItem>> {
    self.items.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn persist(&self, items: &[QueueItem]) {
    if let Err(e) = self.store.save(items) {
      warn!(error = %e, "failed to persist offline queue");
    }
  }

  pub fn is_online(&self) -> bool {
    *self.connectivity.borrow()
  }

  /// Append a write and persist the queue. Never fails.
  ///
  /// When online, a flush is started in the background.
  pub fn enqueue(self: &Arc<Self>, entity_type: &str, action: Action, payload: Value) -> QueueItem {
    let item = QueueItem {
      entity_type: entity_type.to_string(),
      action,
      payload,
      timestamp: self.clock.now_ms(),
    };

    let pending = {
      let mut items = self.items();
      items.push(item.clone());
      self.persist(&items);
      items.len()
    };
    info!(entity_type, ?action, pending, "queued write for later sync");

    if self.is_online() {
      let queue = Arc::clone(self);
      let task = tokio::spawn(async move {
        queue.flush().await;
      });
      let mut background = self.background();
      background.retain(|task| !task.is_finished());
      background.push(task);
    }

    item
  }

  /// Submit the whole queue in one batch and drop the confirmed prefix.
  ///
  /// The number of successes K is counted over the whole response and the
  /// first K items are removed, whatever their individual results were.
  pub async fn flush(&self) -> FlushOutcome {
    if self.flushing.load(Ordering::Acquire) {
      return FlushOutcome::AlreadyFlushing;
    }
    if self.is_empty() {
      return FlushOutcome::Empty;
    }
    if !self.is_online() {
      return FlushOutcome::Offline;
    }
    let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
      return FlushOutcome::AlreadyFlushing;
    };

    let request = SyncRequest {
      sync_items: self.items().iter().map(SyncItem::from).collect(),
    };
    let submitted = request.sync_items.len();
    if submitted == 0 {
      return FlushOutcome::Empty;
    }
    debug!(submitted, "flushing offline queue");

    match self.transport.sync_batch(&request).await {
      Ok(response) => {
        let confirmed = response.confirmed_count();
        let remaining = {
          let mut items = self.items();
          let trimmed = confirmed.min(items.len());
          items.drain(..trimmed);
          self.persist(&items);
          items.len()
        };
        info!(submitted, confirmed, remaining, "offline queue synced");
        FlushOutcome::Synced {
          submitted,
          confirmed,
          remaining,
        }
      }
      Err(e) => {
        warn!(error = %e, submitted, "offline queue sync failed");
        FlushOutcome::Failed(e.to_string())
      }
    }
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Snapshot of pending items, oldest first.
  pub fn items_snapshot(&self) -> Vec<QueueItem> {
    self.items().clone()
  }

  /// Drop every pending write.
  pub fn clear(&self) {
    let mut items = self.items();
    let dropped = items.len();
    items.clear();
    self.persist(&items);
    info!(dropped, "offline queue cleared");
  }
}

impl<K, T, C> Drop for MutationQueue<K, T, C> {
  fn drop(&mut self) {
    if let Some(listener) = self
      .listener
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      listener.abort();
    }
  }
}
