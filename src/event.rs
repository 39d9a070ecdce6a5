use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};

use crate::proxy::RegistrationEvent;
use crate::update::UpdateStatus;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// A line typed on stdin
  Input(String),
  /// Online state changed
  Connectivity(bool),
  /// Proxy lifecycle change
  Registration(RegistrationEvent),
  /// Update prompt state changed
  Update(UpdateStatus),
  /// The page asked to be reloaded
  Reload,
  /// Periodic tick for status logging
  Tick,
}

/// Event handler that merges input lines, a tick timer and forwarded
/// service notifications into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Start reading commands from stdin
  pub fn read_input(&self) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(Event::Input(line)).is_err() {
          break;
        }
      }
    });
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Forward every change of a watch channel as an event.
pub fn forward_watch<T, F>(mut rx: watch::Receiver<T>, tx: mpsc::UnboundedSender<Event>, map: F)
where
  T: Clone + Send + Sync + 'static,
  F: Fn(T) -> Event + Send + 'static,
{
  tokio::spawn(async move {
    while rx.changed().await.is_ok() {
      let value = rx.borrow_and_update().clone();
      if tx.send(map(value)).is_err() {
        break;
      }
    }
  });
}

/// Forward registration events, skipping over any that lagged behind.
pub fn forward_registration(
  mut rx: broadcast::Receiver<RegistrationEvent>,
  tx: mpsc::UnboundedSender<Event>,
) {
  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(event) => {
          if tx.send(Event::Registration(event)).is_err() {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_ticks_after_first_period() {
    let mut events = EventHandler::new(Duration::from_secs(10));
    let next = tokio::time::timeout(Duration::from_secs(11), events.next())
      .await
      .unwrap();
    assert!(matches!(next, Some(Event::Tick)));
  }

  #[tokio::test]
  async fn test_forwards_watch_changes() {
    let mut events = EventHandler::new(Duration::from_secs(3600));
    let (tx, rx) = watch::channel(false);
    forward_watch(rx, events.sender(), Event::Connectivity);

    tx.send_replace(true);
    assert!(matches!(events.next().await, Some(Event::Connectivity(true))));
  }

  #[tokio::test]
  async fn test_forwards_registration_events() {
    let mut events = EventHandler::new(Duration::from_secs(3600));
    let (tx, rx) = broadcast::channel(4);
    forward_registration(rx, events.sender());

    tx.send(RegistrationEvent::ControllerChange {
      version: "v2".to_string(),
    })
    .unwrap();
    match events.next().await {
      Some(Event::Registration(RegistrationEvent::ControllerChange { version })) => {
        assert_eq!(version, "v2")
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }
}
