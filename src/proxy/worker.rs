//! One deployed version of the cache proxy and its lifecycle.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::{offline_api_response, offline_asset_response, Policy};
use super::Network;
use crate::cache::{CacheStorage, Request, Response};
use crate::config::Config;

/// Static settings shared by every proxy version.
#[derive(Debug, Clone)]
pub struct ProxySettings {
  /// Origin the precache manifest and version endpoint are resolved against
  pub origin: Url,
  pub cache_prefix: String,
  pub api_marker: String,
  pub precache: Vec<String>,
  pub skip_waiting_on_install: bool,
  pub version_url: Option<String>,
}

impl ProxySettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;

    Ok(Self {
      origin,
      cache_prefix: config.proxy.cache_prefix.clone(),
      api_marker: config.api.marker.clone(),
      precache: config.proxy.precache.clone(),
      skip_waiting_on_install: config.proxy.skip_waiting_on_install,
      version_url: config.proxy.version_url.clone(),
    })
  }

  /// Name of the cache owned by `version`.
  pub fn cache_name(&self, version: &str) -> String {
    format!("{}-{}", self.cache_prefix, version)
  }
}

/// Lifecycle of a proxy version.
///
/// `Installed` doubles as "waiting" while an older version still controls
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced by a newer version
  Redundant,
}

/// Messages a page can post to a proxy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Promote a waiting version without waiting for open pages to close
  SkipWaiting,
}

pub struct ProxyWorker<S, N> {
  version: String,
  cache_name: String,
  settings: Arc<ProxySettings>,
  storage: Arc<S>,
  network: Arc<N>,
  state: watch::Sender<WorkerState>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage, N: Network> ProxyWorker<S, N> {
  pub fn new(version: &str, settings: Arc<ProxySettings>, storage: Arc<S>, network: Arc<N>) -> Self {
    Self::with_state(version, settings, storage, network, WorkerState::Installing)
  }

  /// Rebuild a version that was already activated before a restart.
  pub fn resume(
    version: &str,
    settings: Arc<ProxySettings>,
    storage: Arc<S>,
    network: Arc<N>,
  ) -> Self {
    Self::with_state(version, settings, storage, network, WorkerState::Activated)
  }

  fn with_state(
    version: &str,
    settings: Arc<ProxySettings>,
    storage: Arc<S>,
    network: Arc<N>,
    state: WorkerState,
  ) -> Self {
    let (state, _) = watch::channel(state);
    Self {
      version: version.to_string(),
      cache_name: settings.cache_name(version),
      settings,
      storage,
      network,
      state,
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Watch state transitions of this version.
  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  fn set_state(&self, state: WorkerState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      debug!(version = %self.version, from = ?previous, to = ?state, "proxy state change");
    }
  }

  pub fn mark_redundant(&self) {
    self.set_state(WorkerState::Redundant);
  }

  /// Ask to be promoted as soon as installation finishes.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub fn on_message(&self, message: ControlMessage) {
    match message {
      ControlMessage::SkipWaiting => {
        debug!(version = %self.version, "received skip-waiting");
        self.skip_waiting();
      }
    }
  }

  /// Open this version's cache and populate it with the precache manifest.
  ///
  /// Any failed or non-2xx fetch fails the whole installation and leaves
  /// the version redundant.
  pub async fn install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(count) => {
        info!(version = %self.version, entries = count, "proxy version installed");
        self.set_state(WorkerState::Installed);
        if self.settings.skip_waiting_on_install {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        warn!(version = %self.version, error = %e, "proxy installation failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    self.storage.open_cache(&self.cache_name)?;

    let requests = self
      .settings
      .precache
      .iter()
      .map(|path| {
        self
          .settings
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid precache entry '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.iter().map(|request| async move {
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok(response)
    });
    let responses = futures::future::try_join_all(fetches).await?;

    for (request, response) in requests.iter().zip(&responses) {
      self.storage.put(&self.cache_name, request, response)?;
    }

    Ok(responses.len())
  }

  /// Evict every cache that does not belong to this version.
  pub async fn activate(&self) -> Result<()> {
    self.set_state(WorkerState::Activating);

    for name in self.storage.cache_names()? {
      if name != self.cache_name {
        self.storage.delete_cache(&name)?;
        info!(cache = %name, "evicted stale cache");
      }
    }

    self.set_state(WorkerState::Activated);
    info!(version = %self.version, "proxy version activated");
    Ok(())
  }

  /// Serve an intercepted request.
  ///
  /// Connectivity failures never surface here; they are answered from the
  /// cache or with a synthetic response. Only a version that has not
  /// reached `Activated` returns an error.
  pub async fn handle(&self, request: &Request) -> Result<Response> {
    let state = self.state();
    if state != WorkerState::Activated {
      return Err(eyre!(
        "Proxy version {} cannot serve requests while {:?}",
        self.version,
        state
      ));
    }

    let response = match Policy::for_request(request, &self.settings.api_marker) {
      Policy::RemoteData => self.remote_data(request).await,
      Policy::StaticAsset => self.static_asset(request).await,
    };
    Ok(response)
  }

  async fn remote_data(&self, request: &Request) -> Response {
    match self.network.fetch(request).await {
      Ok(response) => {
        if request.is_get() {
          if let Err(e) = self.storage.put(&self.cache_name, request, &response) {
            warn!(url = %request.url, error = %e, "failed to cache api response");
          }
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network unavailable, trying cache");
        self.cached(request).unwrap_or_else(offline_api_response)
      }
    }
  }

  async fn static_asset(&self, request: &Request) -> Response {
    if let Some(response) = self.cached(request) {
      return response;
    }

    match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "asset unavailable offline");
        offline_asset_response()
      }
    }
  }

  fn cached(&self, request: &Request) -> Option<Response> {
    match self.storage.lookup(&self.cache_name, request) {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }
}
