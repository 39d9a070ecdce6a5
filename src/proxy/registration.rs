//! Tracks which proxy version controls requests and which is waiting.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::worker::{ControlMessage, ProxySettings, ProxyWorker, WorkerState};
use super::Network;
use crate::cache::{CacheStorage, Request, Response};
use crate::db::KeyValueStore;

/// Key remembering the activated version across restarts
pub const ACTIVE_VERSION_KEY: &str = "proxy.active_version";

/// Lifecycle notifications published by a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
  /// A new version started installing
  UpdateFound { version: String },
  /// An installed version is waiting for the current one to yield
  Waiting { version: String },
  /// A version took control of requests
  ControllerChange { version: String },
  InstallFailed { version: String, error: String },
}

/// A view of a proxy version that pages may observe.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  pub version: String,
  pub state: watch::Receiver<WorkerState>,
}

/// What the update controller needs from a registration.
pub trait ServiceRegistration: Send + Sync + 'static {
  /// Whether some activated version is currently controlling requests.
  fn has_controller(&self) -> bool;

  fn waiting(&self) -> Option<WorkerHandle>;

  fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent>;

  /// Deliver a control message to the waiting version.
  fn post_message(&self, message: ControlMessage) -> impl Future<Output = Result<()>> + Send;

  /// Check for a newer deployed version and install it if found.
  fn update(&self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Deserialize)]
struct VersionManifest {
  version: String,
}

struct Slots<S, N> {
  installing: Option<Arc<ProxyWorker<S, N>>>,
  waiting: Option<Arc<ProxyWorker<S, N>>>,
  active: Option<Arc<ProxyWorker<S, N>>>,
}

pub struct Registration<S, N, K> {
  settings: Arc<ProxySettings>,
  storage: Arc<S>,
  network: Arc<N>,
  kv: Arc<K>,
  slots: Mutex<Slots<S, N>>,
  events: broadcast::Sender<RegistrationEvent>,
}

impl<S: CacheStorage, N: Network, K: KeyValueStore> Registration<S, N, K> {
  pub fn new(settings: ProxySettings, storage: Arc<S>, network: Arc<N>, kv: Arc<K>) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      settings: Arc::new(settings),
      storage,
      network,
      kv,
      slots: Mutex::new(Slots {
        installing: None,
        waiting: None,
        active: None,
      }),
      events,
    }
  }

  /// Resume the version that was active before the last shutdown.
  ///
  /// The remembered version is ignored when its cache no longer exists.
  pub fn restore(settings: ProxySettings, storage: Arc<S>, network: Arc<N>, kv: Arc<K>) -> Result<Self> {
    let registration = Self::new(settings, storage, network, kv);

    if let Some(version) = registration.kv.get(ACTIVE_VERSION_KEY)? {
      let cache_name = registration.settings.cache_name(&version);
      if registration.storage.cache_names()?.contains(&cache_name) {
        let worker = ProxyWorker::resume(
          &version,
          Arc::clone(&registration.settings),
          Arc::clone(&registration.storage),
          Arc::clone(&registration.network),
        );
        registration.slots().active = Some(Arc::new(worker));
        debug!(version = %version, "resumed active proxy version");
      } else {
        warn!(version = %version, "cache of remembered proxy version is gone");
        registration.kv.remove(ACTIVE_VERSION_KEY)?;
      }
    }

    Ok(registration)
  }

  fn slots(&self) -> MutexGuard<'_, Slots<S, N>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: RegistrationEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  pub fn active_version(&self) -> Option<String> {
    self.slots().active.as_ref().map(|w| w.version().to_string())
  }

  pub fn waiting_version(&self) -> Option<String> {
    self.slots().waiting.as_ref().map(|w| w.version().to_string())
  }

  fn is_known(&self, version: &str) -> bool {
    let slots = self.slots();
    let known = slots
      .installing
      .iter()
      .chain(&slots.waiting)
      .chain(&slots.active)
      .any(|w| w.version() == version);
    known
  }

  /// Install `version` unless it is already installing, waiting or active.
  ///
  /// Returns the new worker when an installation happened.
  pub async fn ensure_version(&self, version: &str) -> Result<Option<Arc<ProxyWorker<S, N>>>> {
    if self.is_known(version) {
      return Ok(None);
    }
    self.register(version).await.map(Some)
  }

  /// Install a new version.
  ///
  /// Without a current controller, or when the version asked to skip
  /// waiting, it is activated immediately. Otherwise it waits. A failed
  /// installation leaves the active version untouched.
  pub async fn register(&self, version: &str) -> Result<Arc<ProxyWorker<S, N>>> {
    let worker = Arc::new(ProxyWorker::new(
      version,
      Arc::clone(&self.settings),
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));
    self.slots().installing = Some(Arc::clone(&worker));
    self.emit(RegistrationEvent::UpdateFound {
      version: version.to_string(),
    });

    let installed = worker.install().await;
    {
      let mut slots = self.slots();
      if slots
        .installing
        .as_ref()
        .is_some_and(|w| Arc::ptr_eq(w, &worker))
      {
        slots.installing = None;
      }
    }
    if let Err(e) = installed {
      self.emit(RegistrationEvent::InstallFailed {
        version: version.to_string(),
        error: e.to_string(),
      });
      return Err(e);
    }

    let has_controller = self.slots().active.is_some();
    if !has_controller || worker.wants_skip_waiting() {
      self.promote(&worker).await?;
    } else {
      let previous = self.slots().waiting.replace(Arc::clone(&worker));
      if let Some(previous) = previous {
        previous.mark_redundant();
      }
      info!(version = %version, "proxy version waiting for current one to yield");
      self.emit(RegistrationEvent::Waiting {
        version: version.to_string(),
      });
    }

    Ok(worker)
  }

  /// Activate a worker and hand it control of all requests.
  async fn promote(&self, worker: &Arc<ProxyWorker<S, N>>) -> Result<()> {
    if let Err(e) = worker.activate().await {
      worker.mark_redundant();
      return Err(e);
    }

    let previous = {
      let mut slots = self.slots();
      if slots
        .waiting
        .as_ref()
        .is_some_and(|w| Arc::ptr_eq(w, worker))
      {
        slots.waiting = None;
      }
      slots.active.replace(Arc::clone(worker))
    };
    if let Some(previous) = previous {
      previous.mark_redundant();
    }

    if let Err(e) = self.kv.set(ACTIVE_VERSION_KEY, worker.version()) {
      warn!(error = %e, "failed to remember active proxy version");
    }
    self.emit(RegistrationEvent::ControllerChange {
      version: worker.version().to_string(),
    });
    Ok(())
  }

  async fn deliver(&self, message: ControlMessage) -> Result<()> {
    let waiting = self.slots().waiting.clone();
    let Some(worker) = waiting else {
      debug!(?message, "no waiting proxy version");
      return Ok(());
    };

    worker.on_message(message);
    if worker.wants_skip_waiting() {
      self.promote(&worker).await?;
    }
    Ok(())
  }

  async fn check_for_update(&self) -> Result<()> {
    let Some(path) = self.settings.version_url.as_deref() else {
      debug!("no version endpoint configured");
      return Ok(());
    };
    let url = self
      .settings
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid version endpoint '{}': {}", path, e))?;

    // Version checks bypass the proxy so a stale cache cannot mask a deployment
    let response = self.network.fetch(&Request::get(url.clone())).await?;
    if !response.is_ok() {
      return Err(eyre!("Version check at {} failed with status {}", url, response.status));
    }
    let manifest: VersionManifest = serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Invalid version manifest at {}: {}", url, e))?;

    self.ensure_version(&manifest.version).await?;
    Ok(())
  }

  /// Route a request through the controlling version, or straight to the
  /// network when nothing controls this client yet.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    let active = self.slots().active.clone();
    match active {
      Some(worker) => worker.handle(request).await,
      None => self.network.fetch(request).await,
    }
  }
}

impl<S: CacheStorage, N: Network, K: KeyValueStore> ServiceRegistration for Registration<S, N, K> {
  fn has_controller(&self) -> bool {
    self.slots().active.is_some()
  }

  fn waiting(&self) -> Option<WorkerHandle> {
    self.slots().waiting.as_ref().map(|w| WorkerHandle {
      version: w.version().to_string(),
      state: w.subscribe(),
    })
  }

  fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
    self.events.subscribe()
  }

  fn post_message(&self, message: ControlMessage) -> impl Future<Output = Result<()>> + Send {
    self.deliver(message)
  }

  fn update(&self) -> impl Future<Output = Result<()>> + Send {
    self.check_for_update()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::{self, FakeNetwork};

  type TestRegistration = Registration<SqliteStorage, FakeNetwork, Database>;

  struct Fixture {
    db: Arc<Database>,
    network: Arc<FakeNetwork>,
  }

  impl Fixture {
    fn new() -> Self {
      let network = FakeNetwork::new();
      testing::serve_precache(&network);
      Self {
        db: Arc::new(Database::open_in_memory().unwrap()),
        network: Arc::new(network),
      }
    }

    fn storage(&self) -> SqliteStorage {
      SqliteStorage::new(Arc::clone(&self.db))
    }

    fn registration(&self) -> TestRegistration {
      Registration::restore(
        testing::settings(),
        Arc::new(self.storage()),
        Arc::clone(&self.network),
        Arc::clone(&self.db),
      )
      .unwrap()
    }

    fn advertise(&self, version: &str) {
      self.network.route(
        &testing::url("/version.json").to_string(),
        Response::new(200, Some("application/json"), format!(r#"{{"version":"{}"}}"#, version)),
      );
    }
  }

  #[tokio::test]
  async fn test_first_version_activates_immediately() {
    let fx = Fixture::new();
    let registration = fx.registration();
    assert!(!registration.has_controller());

    let worker = registration.register("v1").await.unwrap();

    assert_eq!(worker.state(), WorkerState::Activated);
    assert!(registration.has_controller());
    assert_eq!(registration.active_version().as_deref(), Some("v1"));
    assert_eq!(fx.db.get(ACTIVE_VERSION_KEY).unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_second_version_waits_until_skip_waiting() {
    let fx = Fixture::new();
    let registration = fx.registration();
    let mut events = registration.subscribe();
    registration.register("v1").await.unwrap();

    let v2 = registration.register("v2").await.unwrap();
    assert_eq!(v2.state(), WorkerState::Installed);
    assert_eq!(registration.waiting_version().as_deref(), Some("v2"));
    assert_eq!(registration.active_version().as_deref(), Some("v1"));

    registration.post_message(ControlMessage::SkipWaiting).await.unwrap();

    assert_eq!(v2.state(), WorkerState::Activated);
    assert_eq!(registration.active_version().as_deref(), Some("v2"));
    assert!(registration.waiting().is_none());
    assert_eq!(fx.storage().cache_names().unwrap(), vec!["erp-cache-v2"]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert!(seen.contains(&RegistrationEvent::Waiting {
      version: "v2".to_string()
    }));
    assert_eq!(
      seen.last(),
      Some(&RegistrationEvent::ControllerChange {
        version: "v2".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_version_serving() {
    let fx = Fixture::new();
    let registration = fx.registration();
    registration.register("v1").await.unwrap();

    fx.network.set_online(false);
    assert!(registration.register("v2").await.is_err());
    assert_eq!(registration.active_version().as_deref(), Some("v1"));
    assert!(registration.waiting().is_none());

    let response = registration
      .fetch(&Request::get(testing::url("/index.html")))
      .await
      .unwrap();
    assert_eq!(response.text(), "<html>index</html>");
  }

  #[tokio::test]
  async fn test_restore_resumes_active_version() {
    let fx = Fixture::new();
    fx.registration().register("v1").await.unwrap();

    let restored = fx.registration();
    assert_eq!(restored.active_version().as_deref(), Some("v1"));

    fx.network.set_online(false);
    let response = restored.fetch(&Request::get(testing::url("/"))).await.unwrap();
    assert_eq!(response.text(), "<html>root</html>");
  }

  #[tokio::test]
  async fn test_restore_ignores_version_without_cache() {
    let fx = Fixture::new();
    fx.db.set(ACTIVE_VERSION_KEY, "v9").unwrap();

    assert_eq!(fx.registration().active_version(), None);
    assert_eq!(fx.db.get(ACTIVE_VERSION_KEY).unwrap(), None);
  }

  #[tokio::test]
  async fn test_update_installs_advertised_version_once() {
    let fx = Fixture::new();
    let registration = fx.registration();
    registration.register("v1").await.unwrap();

    fx.advertise("v1");
    registration.update().await.unwrap();
    assert!(registration.waiting().is_none());

    fx.advertise("v2");
    registration.update().await.unwrap();
    registration.update().await.unwrap();
    let waiting = registration.waiting().unwrap();
    assert_eq!(waiting.version, "v2");
    assert_eq!(*waiting.state.borrow(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_ensure_version_skips_known_versions() {
    let fx = Fixture::new();
    let registration = fx.registration();

    assert!(registration.ensure_version("v1").await.unwrap().is_some());
    assert!(registration.ensure_version("v1").await.unwrap().is_none());

    assert!(registration.ensure_version("v2").await.unwrap().is_some());
    assert!(registration.ensure_version("v2").await.unwrap().is_none());
    assert!(registration.ensure_version("v1").await.unwrap().is_none());
    assert_eq!(registration.waiting_version().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_update_reports_unreachable_endpoint() {
    let fx = Fixture::new();
    let registration = fx.registration();
    fx.network.set_online(false);

    assert!(registration.update().await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_without_controller_goes_to_network() {
    let fx = Fixture::new();
    let registration = fx.registration();

    let response = registration
      .fetch(&Request::get(testing::url("/index.html")))
      .await
      .unwrap();
    assert_eq!(response.text(), "<html>index</html>");

    fx.network.set_online(false);
    assert!(registration
      .fetch(&Request::get(testing::url("/index.html")))
      .await
      .is_err());
  }
}
