//! Online/offline signal shared by the queue and the page host.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use crate::cache::Request;
use crate::proxy::Network;

#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns true when it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Send one probe to `url` and record the outcome.
  ///
  /// Any HTTP response counts as online; only a failed request means offline.
  pub async fn probe<N: Network>(&self, network: &N, url: &Url) -> bool {
    let online = network
      .fetch(&Request::new("HEAD", url.clone(), None))
      .await
      .is_ok();
    self.set_online(online);
    online
  }

  /// Probe `url` every `interval`, starting immediately.
  pub fn spawn_probe<N: Network>(&self, network: Arc<N>, url: Url, interval: Duration) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        connectivity.probe(network.as_ref(), &url).await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{self, FakeNetwork};

  #[tokio::test]
  async fn test_set_online_reports_changes_only() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    assert!(!connectivity.set_online(false));
    assert!(connectivity.set_online(true));
    assert!(rx.has_changed().unwrap());
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_tracks_network() {
    let network = Arc::new(FakeNetwork::new());
    let connectivity = Connectivity::new(false);
    let probe = connectivity.spawn_probe(
      Arc::clone(&network),
      testing::url("/api/health/"),
      Duration::from_secs(30),
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(connectivity.is_online());

    network.set_online(false);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!connectivity.is_online());

    probe.abort();
  }

  #[tokio::test]
  async fn test_error_status_still_counts_as_online() {
    let network = FakeNetwork::new();
    let connectivity = Connectivity::new(false);

    // Unrouted URLs answer 404
    assert!(connectivity.probe(&network, &testing::url("/missing")).await);

    network.set_online(false);
    assert!(!connectivity.probe(&network, &testing::url("/missing")).await);
    assert!(!connectivity.is_online());
  }
}
