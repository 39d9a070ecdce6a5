//! Time source injected into services that stamp records.

use chrono::Utc;

pub trait Clock: Send + Sync + 'static {
  /// Milliseconds since the Unix epoch
  fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Clock pinned to a single instant.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

#[cfg(test)]
impl Clock for FixedClock {
  fn now_ms(&self) -> i64 {
    self.0
  }
}
