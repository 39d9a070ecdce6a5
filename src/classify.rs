//! Tells queued writes apart from genuine write failures.
//!
//! A write that could not reach the server is captured by the mutation
//! queue and reported to its caller as an error whose message starts with
//! [`QUEUED_SENTINEL`]. Call sites treat that as a soft success.

use color_eyre::{eyre::eyre, Report};
use tracing::info;

pub const QUEUED_SENTINEL: &str = "OFFLINE_QUEUED:";

/// Build the sentinel error for a write captured under `reference`.
pub fn queued_write_error(reference: &str) -> Report {
  eyre!("{}{}", QUEUED_SENTINEL, reference)
}

pub fn is_queued_message(message: &str) -> bool {
  message.starts_with(QUEUED_SENTINEL)
}

/// Returns true when `error` means "saved, will sync later".
///
/// Any other error returns false and should be handled as a failure.
pub fn is_queued_write(error: &Report) -> bool {
  let queued = error.chain().any(|cause| is_queued_message(&cause.to_string()));
  if queued {
    info!("saved offline, will sync later");
  }
  queued
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sentinel_is_queued() {
    assert!(is_queued_write(&eyre!("OFFLINE_QUEUED:abc123")));
    assert!(is_queued_write(&queued_write_error("ticket")));
  }

  #[test]
  fn test_other_errors_are_failures() {
    assert!(!is_queued_write(&eyre!("Validation failed")));
    assert!(!is_queued_write(&eyre!("request failed: OFFLINE_QUEUED:abc")));
  }

  #[test]
  fn test_sentinel_found_under_context() {
    let error = queued_write_error("note").wrap_err("Failed to save note");
    assert!(is_queued_write(&error));
  }
}
