use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub proxy: ProxyConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub updates: UpdatesConfig,
  #[serde(default)]
  pub device: DeviceConfig,
  #[serde(default)]
  pub push: PushConfig,
  /// Override for the state database location
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin of the ERP deployment (e.g. "https://erp.example.com")
  pub url: String,
  /// Substring that routes a request to the remote-data policy
  #[serde(default = "default_api_marker")]
  pub marker: String,
  #[serde(default = "default_sync_path")]
  pub sync_path: String,
  #[serde(default = "default_push_key_path")]
  pub push_key_path: String,
  #[serde(default = "default_push_subscribe_path")]
  pub push_subscribe_path: String,
  #[serde(default = "default_health_path")]
  pub health_path: String,
  /// Request timeout in seconds
  #[serde(default = "default_request_timeout")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub cache_prefix: String,
  /// Version tag of the deployed proxy; a change here is a new deployment
  pub version: String,
  /// Root-relative URLs populated into the cache at install time
  pub precache: Vec<String>,
  /// Promote a freshly installed version without waiting for a prompt
  pub skip_waiting_on_install: bool,
  /// Endpoint advertising the latest deployed version as `{"version": "..."}`
  pub version_url: Option<String>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      cache_prefix: "erp-cache".to_string(),
      version: "v1".to_string(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
      ],
      skip_waiting_on_install: false,
      version_url: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// How often `watch` probes the API to detect connectivity changes
  pub probe_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
  pub check_interval_secs: u64,
  pub reload_timeout_ms: u64,
  /// Adopt new versions without waiting for confirmation
  pub auto_update: bool,
}

impl Default for UpdatesConfig {
  fn default() -> Self {
    Self {
      check_interval_secs: 5 * 60,
      reload_timeout_ms: 1000,
      auto_update: false,
    }
  }
}

impl UpdatesConfig {
  pub fn check_interval(&self) -> Duration {
    Duration::from_secs(self.check_interval_secs)
  }

  pub fn reload_timeout(&self) -> Duration {
    Duration::from_millis(self.reload_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
  pub device_type: String,
  pub device_info: String,
}

impl Default for DeviceConfig {
  fn default() -> Self {
    Self {
      device_type: "desktop".to_string(),
      device_info: format!("offline-relay/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  /// Whether this host grants notification permission
  pub enabled: bool,
  /// Push service endpoint handed to the server in new subscriptions
  pub endpoint: Option<String>,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      endpoint: None,
    }
  }
}

fn default_api_marker() -> String {
  "/api/".to_string()
}

fn default_sync_path() -> String {
  "/api/sync/bulk/".to_string()
}

fn default_push_key_path() -> String {
  "/api/notifications/vapid-public-key/".to_string()
}

fn default_push_subscribe_path() -> String {
  "/api/notifications/subscribe/".to_string()
}

fn default_health_path() -> String {
  "/api/health/".to_string()
}

fn default_request_timeout() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-relay/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.url).map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks OFFLINE_RELAY_TOKEN first, then ERP_API_TOKEN as fallback.
  /// Requests go out unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFLINE_RELAY_TOKEN")
      .or_else(|_| std::env::var("ERP_API_TOKEN"))
      .ok()
  }

  /// Directory holding the state database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(parent) = self.database.as_ref().and_then(|p| p.parent()) {
      return Ok(parent.to_path_buf());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-relay"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(self.data_dir()?.join("state.db")),
    }
  }
}
