mod api;
mod app;
mod cache;
mod classify;
mod clock;
mod config;
mod connectivity;
mod db;
mod event;
mod platform;
mod proxy;
mod push;
mod queue;
mod update;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::queue::Action;

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "Offline cache proxy and write queue for the ERP API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a write without trying the API
  Enqueue {
    entity_type: String,
    /// create, update or delete
    action: Action,
    /// JSON payload
    payload: String,
  },
  /// Send a write, queueing it if the API is unreachable
  Write {
    entity_type: String,
    action: Action,
    /// API path, e.g. /api/notes/12/
    path: String,
    payload: String,
  },
  /// Replay queued writes now
  Flush,
  /// Show connectivity, proxy versions and pending writes
  Status,
  /// Drop all queued writes
  Clear,
  /// Send a request through the cache proxy
  Fetch {
    path: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Install the configured proxy version
  Install,
  /// Look for a newly deployed version
  CheckUpdate {
    /// Switch to the new version right away
    #[arg(long)]
    apply: bool,
  },
  /// Register this device for push notifications
  PushRegister,
  /// Display a push payload as a notification
  Notify {
    /// JSON payload as sent by the server
    payload: Option<String>,
    /// Also simulate clicking the notification
    #[arg(long)]
    click: bool,
  },
  /// Stay running: probe connectivity, sync on reconnect, prompt for updates
  Watch,
}

fn parse_payload(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Payload is not valid JSON: {}", e))
}

/// Log to a daily file under the data directory
fn init_logging(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
  let appender = tracing_appender::rolling::daily(log_dir, "offline-relay.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.data_dir()?.join("logs"));

  let mut app = app::App::new(config)?;
  match args.command {
    Command::Enqueue {
      entity_type,
      action,
      payload,
    } => app.enqueue(&entity_type, action, parse_payload(&payload)?),
    Command::Write {
      entity_type,
      action,
      path,
      payload,
    } => {
      app
        .write(&entity_type, action, &path, parse_payload(&payload)?)
        .await?
    }
    Command::Flush => app.flush().await?,
    Command::Status => app.status().await?,
    Command::Clear => app.clear(),
    Command::Fetch { path, method, body } => app.fetch(&method, &path, body).await?,
    Command::Install => app.install().await?,
    Command::CheckUpdate { apply } => app.check_update(apply).await?,
    Command::PushRegister => app.push_register().await?,
    Command::Notify { payload, click } => app.notify(payload.as_deref(), click),
    Command::Watch => app.run().await?,
  }

  Ok(())
}
