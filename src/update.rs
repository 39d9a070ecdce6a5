//! Page-side controller for adopting new proxy versions.
//!
//! When a new version finishes installing while an older one still
//! controls requests, the controller raises an "update available" prompt
//! once for that version. Accepting the prompt tells the waiting version
//! to skip waiting and reloads the page as soon as it has activated, or
//! after a short timeout if the activation is never observed.

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::proxy::{ControlMessage, RegistrationEvent, ServiceRegistration, WorkerState};

/// How long check results stay visible
const MESSAGE_TTL: Duration = Duration::from_secs(4);

/// The page hosting the controller.
pub trait Page: Send + Sync + 'static {
  fn reload(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
  pub kind: StatusKind,
  pub text: String,
}

/// Everything a UI needs to render the update prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStatus {
  pub update_available: bool,
  /// Version behind the current prompt
  pub version: Option<String>,
  pub message: Option<StatusMessage>,
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
  pub check_interval: Duration,
  /// Reload anyway if activation is not seen within this delay
  pub reload_timeout: Duration,
}

impl Default for UpdateSettings {
  fn default() -> Self {
    Self {
      check_interval: Duration::from_secs(5 * 60),
      reload_timeout: Duration::from_secs(1),
    }
  }
}

pub struct UpdateController<R, P> {
  registration: Option<Arc<R>>,
  page: Arc<P>,
  settings: UpdateSettings,
  /// Last version a prompt was raised for
  prompted: Mutex<Option<String>>,
  status: Arc<watch::Sender<UpdateStatus>>,
}

impl<R: ServiceRegistration, P: Page> UpdateController<R, P> {
  /// Without a registration every operation is a no-op.
  pub fn new(registration: Option<Arc<R>>, page: Arc<P>, settings: UpdateSettings) -> Self {
    let (status, _) = watch::channel(UpdateStatus::default());
    Self {
      registration,
      page,
      settings,
      prompted: Mutex::new(None),
      status: Arc::new(status),
    }
  }

  pub fn status(&self) -> UpdateStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
    self.status.subscribe()
  }

  pub fn update_available(&self) -> bool {
    self.status.borrow().update_available
  }

  fn prompted(&self) -> MutexGuard<'_, Option<String>> {
    self.prompted.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Raise the prompt if a new version is waiting behind an active one.
  ///
  /// Returns true only the first time a given version is seen.
  pub fn detect(&self) -> bool {
    let Some(registration) = &self.registration else {
      return false;
    };
    let Some(waiting) = registration.waiting() else {
      return false;
    };
    if !registration.has_controller() || *waiting.state.borrow() != WorkerState::Installed {
      return false;
    }

    {
      let mut prompted = self.prompted();
      if prompted.as_deref() == Some(waiting.version.as_str()) {
        return false;
      }
      *prompted = Some(waiting.version.clone());
    }

    info!(version = %waiting.version, "update available");
    self.status.send_modify(|status| {
      status.update_available = true;
      status.version = Some(waiting.version.clone());
    });
    true
  }

  /// Hide the prompt until another version is detected.
  pub fn dismiss(&self) {
    self.status.send_modify(|status| status.update_available = false);
  }

  /// Promote the waiting version and reload the page.
  ///
  /// The reload happens once activation is observed or when the timeout
  /// expires, whichever comes first. The timeout also covers delivering
  /// the skip-waiting message.
  pub async fn update_now(&self) {
    let Some(registration) = self.registration.clone() else {
      return;
    };
    self.dismiss();

    if let Some(waiting) = registration.waiting() {
      info!(version = %waiting.version, "adopting new version");
      let mut state = waiting.state;

      let activated = async {
        if let Err(e) = registration.post_message(ControlMessage::SkipWaiting).await {
          warn!(error = %e, "waiting version failed to activate");
        }
        state
          .wait_for(|s| *s == WorkerState::Activated)
          .await
          .is_ok()
      };
      match tokio::time::timeout(self.settings.reload_timeout, activated).await {
        Ok(true) => debug!("new version activated"),
        Ok(false) => debug!("waiting version went away"),
        Err(_) => warn!("activation not observed, forcing reload"),
      }
    }

    self.page.reload();
  }

  /// Ask the registration to look for a new version right now.
  pub async fn check_now(&self) -> Result<()> {
    let Some(registration) = self.registration.clone() else {
      return Ok(());
    };

    match registration.update().await {
      Ok(()) => {
        self.show_message(StatusKind::Success, "Update check complete".to_string());
        self.detect();
        Ok(())
      }
      Err(e) => {
        self.show_message(StatusKind::Error, format!("Update check failed: {}", e));
        Err(e)
      }
    }
  }

  fn show_message(&self, kind: StatusKind, text: String) {
    let message = StatusMessage { kind, text };
    self
      .status
      .send_modify(|status| status.message = Some(message.clone()));

    let status = Arc::clone(&self.status);
    tokio::spawn(async move {
      tokio::time::sleep(MESSAGE_TTL).await;
      status.send_if_modified(|status| {
        if status.message.as_ref() == Some(&message) {
          status.message = None;
          true
        } else {
          false
        }
      });
    });
  }

  /// Watch registration events and check for updates periodically.
  ///
  /// Returns `None` when there is no registration to observe.
  pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
    let registration = self.registration.clone()?;
    let controller = Arc::clone(self);

    Some(tokio::spawn(async move {
      let mut events = registration.subscribe();
      let period = controller.settings.check_interval;
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      controller.detect();

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if let Err(e) = controller.check_now().await {
              debug!(error = %e, "periodic update check failed");
            }
          }
          event = events.recv() => match event {
            Ok(RegistrationEvent::Waiting { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
              controller.detect();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => break,
          },
        }
      }
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::WorkerHandle;
  use color_eyre::eyre::eyre;
  use std::future::Future;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  struct FakeRegistration {
    controller: AtomicBool,
    waiting: Mutex<Option<(String, watch::Sender<WorkerState>)>>,
    events: broadcast::Sender<RegistrationEvent>,
    activate_on_skip: bool,
    stall_on_skip: AtomicBool,
    fail_update: AtomicBool,
    updates: AtomicUsize,
    messages: Mutex<Vec<ControlMessage>>,
  }

  impl FakeRegistration {
    fn new(activate_on_skip: bool) -> Arc<Self> {
      Arc::new(Self {
        controller: AtomicBool::new(true),
        waiting: Mutex::new(None),
        events: broadcast::channel(8).0,
        activate_on_skip,
        stall_on_skip: AtomicBool::new(false),
        fail_update: AtomicBool::new(false),
        updates: AtomicUsize::new(0),
        messages: Mutex::new(Vec::new()),
      })
    }

    fn install_waiting(&self, version: &str) {
      let (state, _) = watch::channel(WorkerState::Installed);
      *self.waiting.lock().unwrap() = Some((version.to_string(), state));
      let _ = self.events.send(RegistrationEvent::Waiting {
        version: version.to_string(),
      });
    }
  }

  impl ServiceRegistration for FakeRegistration {
    fn has_controller(&self) -> bool {
      self.controller.load(Ordering::SeqCst)
    }

    fn waiting(&self) -> Option<WorkerHandle> {
      self
        .waiting
        .lock()
        .unwrap()
        .as_ref()
        .map(|(version, state)| WorkerHandle {
          version: version.clone(),
          state: state.subscribe(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
      self.events.subscribe()
    }

    fn post_message(&self, message: ControlMessage) -> impl Future<Output = Result<()>> + Send {
      self.messages.lock().unwrap().push(message);
      if self.activate_on_skip {
        if let Some((_, state)) = self.waiting.lock().unwrap().as_ref() {
          state.send_replace(WorkerState::Activated);
        }
      }
      let stall = self.stall_on_skip.load(Ordering::SeqCst);
      async move {
        if stall {
          std::future::pending::<()>().await;
        }
        Ok(())
      }
    }

    fn update(&self) -> impl Future<Output = Result<()>> + Send {
      self.updates.fetch_add(1, Ordering::SeqCst);
      let fail = self.fail_update.load(Ordering::SeqCst);
      async move {
        if fail {
          Err(eyre!("network unreachable"))
        } else {
          Ok(())
        }
      }
    }
  }

  #[derive(Default)]
  struct RecordingPage {
    reloads: AtomicUsize,
  }

  impl Page for RecordingPage {
    fn reload(&self) {
      self.reloads.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn controller(
    registration: Option<Arc<FakeRegistration>>,
  ) -> (Arc<UpdateController<FakeRegistration, RecordingPage>>, Arc<RecordingPage>) {
    let page = Arc::new(RecordingPage::default());
    let controller = UpdateController::new(registration, Arc::clone(&page), UpdateSettings::default());
    (Arc::new(controller), page)
  }

  #[tokio::test]
  async fn test_prompts_once_per_version() {
    let registration = FakeRegistration::new(true);
    let (controller, _) = controller(Some(Arc::clone(&registration)));

    assert!(!controller.detect());

    registration.install_waiting("v2");
    assert!(controller.detect());
    assert!(!controller.detect());
    assert_eq!(controller.status().version.as_deref(), Some("v2"));

    controller.dismiss();
    assert!(!controller.update_available());
    assert!(!controller.detect());
    assert!(!controller.update_available());

    registration.install_waiting("v3");
    assert!(controller.detect());
    assert!(controller.update_available());
  }

  #[tokio::test]
  async fn test_no_prompt_without_controller() {
    let registration = FakeRegistration::new(true);
    registration.controller.store(false, Ordering::SeqCst);
    registration.install_waiting("v1");
    let (controller, _) = controller(Some(registration));

    assert!(!controller.detect());
  }

  #[tokio::test]
  async fn test_update_now_reloads_after_activation() {
    let registration = FakeRegistration::new(true);
    registration.install_waiting("v2");
    let (controller, page) = controller(Some(Arc::clone(&registration)));
    controller.detect();

    let started = Instant::now();
    controller.update_now().await;

    assert_eq!(
      registration.messages.lock().unwrap().as_slice(),
      [ControlMessage::SkipWaiting]
    );
    assert_eq!(page.reloads.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!controller.update_available());
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_now_forces_reload_after_timeout() {
    let registration = FakeRegistration::new(false);
    registration.install_waiting("v2");
    let (controller, page) = controller(Some(registration));

    let started = Instant::now();
    controller.update_now().await;

    assert_eq!(page.reloads.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_secs(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_now_reloads_when_skip_message_never_lands() {
    let registration = FakeRegistration::new(false);
    registration.stall_on_skip.store(true, Ordering::SeqCst);
    registration.install_waiting("v2");
    let (controller, page) = controller(Some(Arc::clone(&registration)));

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), controller.update_now())
      .await
      .unwrap();

    assert_eq!(page.reloads.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(registration.messages.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_without_registration_everything_is_noop() {
    let (controller, page) = controller(None);

    assert!(!controller.detect());
    controller.update_now().await;
    controller.check_now().await.unwrap();

    assert_eq!(page.reloads.load(Ordering::SeqCst), 0);
    assert!(controller.spawn().is_none());
    assert_eq!(controller.status(), UpdateStatus::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_check_now_reports_transient_status() {
    let registration = FakeRegistration::new(true);
    let (controller, _) = controller(Some(Arc::clone(&registration)));

    controller.check_now().await.unwrap();
    assert_eq!(
      controller.status().message.map(|m| m.kind),
      Some(StatusKind::Success)
    );

    registration.fail_update.store(true, Ordering::SeqCst);
    assert!(controller.check_now().await.is_err());
    assert_eq!(
      controller.status().message.map(|m| m.kind),
      Some(StatusKind::Error)
    );

    tokio::time::sleep(MESSAGE_TTL + Duration::from_millis(10)).await;
    assert_eq!(controller.status().message, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_checks() {
    let registration = FakeRegistration::new(true);
    let (controller, _) = controller(Some(Arc::clone(&registration)));
    let task = controller.spawn().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(registration.updates.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(4 * 60 + 1)).await;
    assert_eq!(registration.updates.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(registration.updates.load(Ordering::SeqCst), 2);

    task.abort();
  }

  #[tokio::test]
  async fn test_waiting_event_raises_prompt() {
    let registration = FakeRegistration::new(true);
    let (controller, _) = controller(Some(Arc::clone(&registration)));
    let mut status = controller.subscribe();
    let task = controller.spawn().unwrap();
    tokio::task::yield_now().await;

    registration.install_waiting("v2");
    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.update_available))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(controller.status().version.as_deref(), Some("v2"));
    task.abort();
  }
}
