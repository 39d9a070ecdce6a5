use crate::api::{submit_write, ApiClient};
use crate::cache::{CacheStorage, Request, SqliteStorage};
use crate::classify::is_queued_write;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::db::Database;
use crate::event::{forward_registration, forward_watch, Event, EventHandler};
use crate::platform::{LocalPushPlatform, TerminalSurface};
use crate::proxy::{ProxySettings, Registration, RegistrationEvent, ServiceRegistration};
use crate::push::{self, PushRegistration};
use crate::queue::{Action, FlushOutcome, MutationQueue, QueueStore};
use crate::update::{Page, StatusKind, UpdateController, UpdateSettings, UpdateStatus};
use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub type RelayRegistration = Registration<SqliteStorage, ApiClient, Database>;
pub type RelayQueue = MutationQueue<Database, ApiClient, SystemClock>;
pub type RelayUpdates = UpdateController<RelayRegistration, EventPage>;

const HELP: &str = "commands: u(pdate) d(ismiss) c(heck) f(lush) s(tatus) q(uit)";

/// Page reloads are handled by the event loop
pub struct EventPage {
  tx: mpsc::UnboundedSender<Event>,
}

impl Page for EventPage {
  fn reload(&self) {
    let _ = self.tx.send(Event::Reload);
  }
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  db: Arc<Database>,

  /// ERP API client, also the raw network for the proxy
  api: Arc<ApiClient>,

  connectivity: Connectivity,

  storage: Arc<SqliteStorage>,

  registration: Arc<RelayRegistration>,

  queue: Arc<RelayQueue>,

  /// Update controller of the current page
  updates: Arc<RelayUpdates>,

  update_task: Option<JoinHandle<()>>,

  /// Prompt last seen from the update controller, keyed by version
  shown_prompt: Option<Option<String>>,

  events: EventHandler,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  /// Open state and wire services. Connectivity starts offline until probed.
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open_at(&config.database_path()?)?);
    let api = Arc::new(ApiClient::new(&config)?);
    let connectivity = Connectivity::new(false);
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));

    let registration = Arc::new(Registration::restore(
      ProxySettings::from_config(&config)?,
      Arc::clone(&storage),
      Arc::clone(&api),
      Arc::clone(&db),
    )?);

    let queue = MutationQueue::init(
      SystemClock,
      QueueStore::new(Arc::clone(&db)),
      api.as_ref().clone(),
      connectivity.subscribe(),
    );

    let events = EventHandler::new(Duration::from_secs(60));
    let updates = Self::page_controller(&config, &registration, &events);

    Ok(Self {
      config,
      db,
      api,
      connectivity,
      storage,
      registration,
      queue,
      updates,
      update_task: None,
      shown_prompt: None,
      events,
      should_quit: false,
    })
  }

  fn page_controller(
    config: &Config,
    registration: &Arc<RelayRegistration>,
    events: &EventHandler,
  ) -> Arc<RelayUpdates> {
    let settings = UpdateSettings {
      check_interval: config.updates.check_interval(),
      reload_timeout: config.updates.reload_timeout(),
    };
    let page = Arc::new(EventPage {
      tx: events.sender(),
    });
    Arc::new(UpdateController::new(Some(Arc::clone(registration)), page, settings))
  }

  fn health_url(&self) -> Result<Url> {
    self.api.endpoint(&self.config.api.health_path)
  }

  /// Probe the API once and record the result.
  ///
  /// One-shot commands flush explicitly, so the reconnect listener is
  /// stopped before the state can flip to online.
  pub async fn probe(&self) -> Result<bool> {
    self.queue.dispose();
    let url = self.health_url()?;
    Ok(self.connectivity.probe(self.api.as_ref(), &url).await)
  }

  pub fn enqueue(&self, entity_type: &str, action: Action, payload: Value) {
    let item = self.queue.enqueue(entity_type, action, payload);
    println!(
      "Queued {} {} at {} ({} pending)",
      item.action,
      item.entity_type,
      item.timestamp,
      self.queue.len()
    );
  }

  /// Send a write, queueing it when the API cannot be reached
  pub async fn write(&self, entity_type: &str, action: Action, path: &str, payload: Value) -> Result<()> {
    self.probe().await?;

    let result =
      submit_write(self.api.as_ref(), &self.queue, entity_type, action, path, payload).await;
    // A queued write may have started a flush; let it finish before exiting
    self.queue.settle().await;

    match result {
      Ok(value) => {
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
      }
      Err(e) if is_queued_write(&e) => {
        println!("Saved offline, will sync later ({} pending)", self.queue.len());
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  pub async fn flush(&self) -> Result<()> {
    self.probe().await?;
    let outcome = self.queue.flush().await;
    println!("{}", describe_flush(&outcome));
    Ok(())
  }

  pub async fn status(&self) -> Result<()> {
    let online = self.probe().await?;
    println!("API:       {} ({})", self.config.api.url, if online { "online" } else { "offline" });
    self.print_status()
  }

  fn print_status(&self) -> Result<()> {
    println!(
      "Active:    {}",
      self.registration.active_version().as_deref().unwrap_or("none")
    );
    if let Some(waiting) = self.registration.waiting_version() {
      println!("Waiting:   {}", waiting);
    }
    for name in self.storage.cache_names()? {
      println!("Cache:     {} ({} entries)", name, self.storage.urls(&name)?.len());
    }
    println!("Pending:   {}", self.queue.len());
    for item in self.queue.items_snapshot() {
      println!("  {} {} {} {}", item.timestamp, item.action, item.entity_type, item.payload);
    }
    Ok(())
  }

  pub fn clear(&self) {
    let pending = self.queue.len();
    self.queue.clear();
    println!("Dropped {} pending writes", pending);
  }

  /// Route a request through the proxy and print the response
  pub async fn fetch(&self, method: &str, path: &str, body: Option<String>) -> Result<()> {
    let url = self.api.endpoint(path)?;
    let request = Request::new(method, url, body.map(String::into_bytes));
    let response = self.registration.fetch(&request).await?;

    println!(
      "{} {}",
      response.status,
      response.content_type.as_deref().unwrap_or("")
    );
    println!("{}", response.text());
    Ok(())
  }

  /// Install the configured proxy version if it is not known yet
  pub async fn install(&self) -> Result<()> {
    let version = &self.config.proxy.version;
    match self.registration.ensure_version(version).await? {
      Some(worker) => println!("Installed {} ({:?})", version, worker.state()),
      None => println!("{} is already installed", version),
    }
    self.print_status()
  }

  pub async fn check_update(&self, apply: bool) -> Result<()> {
    self.updates.check_now().await?;

    if !self.updates.update_available() {
      println!("Up to date");
      return Ok(());
    }
    let status = self.updates.status();
    println!(
      "Version {} is available",
      status.version.as_deref().unwrap_or("?")
    );
    if apply {
      self.updates.update_now().await;
      println!(
        "Now running {}",
        self.registration.active_version().as_deref().unwrap_or("none")
      );
    }
    Ok(())
  }

  pub async fn push_register(&self) -> Result<()> {
    let platform = LocalPushPlatform::new(Arc::clone(&self.db), self.config.push.clone());
    let outcome = push::register_device(
      &platform,
      self.api.as_ref(),
      &self.config.device.device_type,
      &self.config.device.device_info,
    )
    .await?;

    match outcome {
      PushRegistration::Registered(record) => {
        println!("Registered {} for push notifications", record.device_type)
      }
      PushRegistration::PermissionDenied => {
        println!("Notifications are disabled (push.enabled is false)")
      }
    }
    Ok(())
  }

  /// Show a push payload as a notification
  pub fn notify(&self, payload: Option<&str>, click: bool) {
    let surface = TerminalSurface;
    let notification = push::on_push(&surface, payload.map(str::as_bytes));
    if click {
      push::on_notification_click(&surface, &notification);
    }
  }

  /// Run as a long-lived page host until ctrl-c or `q`
  pub async fn run(&mut self) -> Result<()> {
    let tx = self.events.sender();
    self.events.read_input();
    forward_watch(self.connectivity.subscribe(), tx.clone(), Event::Connectivity);
    forward_registration(self.registration.subscribe(), tx);

    let probe = self.connectivity.spawn_probe(
      Arc::clone(&self.api),
      self.health_url()?,
      Duration::from_secs(self.config.queue.probe_interval_secs),
    );
    self.install_in_background();
    self.start_page();
    println!("{}", HELP);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while !self.should_quit {
      tokio::select! {
        _ = &mut shutdown => self.should_quit = true,
        event = self.events.next() => match event {
          Some(event) => self.handle_event(event)?,
          None => self.should_quit = true,
        },
      }
    }

    probe.abort();
    self.stop_page();
    self.queue.dispose();
    info!("page host stopped");
    Ok(())
  }

  fn install_in_background(&self) {
    let registration = Arc::clone(&self.registration);
    let version = self.config.proxy.version.clone();
    tokio::spawn(async move {
      if let Err(e) = registration.ensure_version(&version).await {
        warn!(version = %version, error = %e, "proxy install failed");
      }
    });
  }

  fn start_page(&mut self) {
    let updates = Self::page_controller(&self.config, &self.registration, &self.events);
    forward_watch(updates.subscribe(), self.events.sender(), Event::Update);
    self.update_task = updates.spawn();
    self.updates = updates;
    self.shown_prompt = None;
  }

  fn stop_page(&mut self) {
    if let Some(task) = self.update_task.take() {
      task.abort();
    }
  }

  fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Input(line) => self.handle_input(line.trim()),
      Event::Connectivity(online) => {
        println!("{}", if online { "Back online" } else { "Offline" });
      }
      Event::Registration(event) => self.handle_registration_event(event),
      Event::Update(status) => self.handle_update_status(status),
      Event::Reload => {
        self.stop_page();
        self.start_page();
        println!(
          "Reloaded under {}",
          self.registration.active_version().as_deref().unwrap_or("no proxy")
        );
      }
      Event::Tick => {
        debug!(
          online = self.connectivity.is_online(),
          pending = self.queue.len(),
          active = ?self.registration.active_version(),
          "status"
        );
      }
    }
    Ok(())
  }

  fn handle_input(&mut self, input: &str) {
    match input {
      "u" | "update" => {
        let updates = Arc::clone(&self.updates);
        tokio::spawn(async move { updates.update_now().await });
      }
      "d" | "dismiss" => self.updates.dismiss(),
      "c" | "check" => {
        let updates = Arc::clone(&self.updates);
        tokio::spawn(async move {
          if let Err(e) = updates.check_now().await {
            debug!(error = %e, "update check failed");
          }
        });
      }
      "f" | "flush" => {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
          let outcome = queue.flush().await;
          println!("{}", describe_flush(&outcome));
        });
      }
      "s" | "status" => {
        if let Err(e) = self.print_status() {
          warn!(error = %e, "failed to read status");
        }
      }
      "q" | "quit" => self.should_quit = true,
      "" => {}
      _ => println!("{}", HELP),
    }
  }

  fn handle_registration_event(&self, event: RegistrationEvent) {
    match event {
      RegistrationEvent::UpdateFound { version } => println!("Installing {}", version),
      RegistrationEvent::Waiting { version } => println!("{} installed, waiting", version),
      RegistrationEvent::ControllerChange { version } => println!("{} now controls requests", version),
      RegistrationEvent::InstallFailed { version, error } => {
        println!("Install of {} failed: {}", version, error)
      }
    }
  }

  /// Whether `status` raises a prompt that was not already showing.
  fn is_new_prompt(&mut self, status: &UpdateStatus) -> bool {
    let shown = status.update_available.then(|| status.version.clone());
    let fresh = shown.is_some() && shown != self.shown_prompt;
    self.shown_prompt = shown;
    fresh
  }

  fn handle_update_status(&mut self, status: UpdateStatus) {
    if let Some(message) = &status.message {
      match message.kind {
        StatusKind::Success => println!("{}", message.text),
        StatusKind::Error => println!("! {}", message.text),
      }
    }
    // Transient messages republish the same prompt
    if !self.is_new_prompt(&status) {
      return;
    }

    if self.config.updates.auto_update {
      let updates = Arc::clone(&self.updates);
      tokio::spawn(async move { updates.update_now().await });
    } else {
      println!(
        "Version {} is available. Type u to update or d to dismiss.",
        status.version.as_deref().unwrap_or("?")
      );
    }
  }
}

fn describe_flush(outcome: &FlushOutcome) -> String {
  match outcome {
    FlushOutcome::AlreadyFlushing => "A flush is already running".to_string(),
    FlushOutcome::Empty => "Nothing to sync".to_string(),
    FlushOutcome::Offline => "Offline, nothing sent".to_string(),
    FlushOutcome::Synced {
      submitted,
      confirmed,
      remaining,
    } => format!(
      "Synced {} of {} writes, {} still pending",
      confirmed, submitted, remaining
    ),
    FlushOutcome::Failed(reason) => format!("Sync failed: {}", reason),
  }
}
