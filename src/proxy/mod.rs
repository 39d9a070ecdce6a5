//! Cache proxy: intercepts every request the client makes and decides
//! whether to answer from the network, from the local cache, or with a
//! synthetic offline response.
//!
//! Versions of the proxy go through an install → activate lifecycle
//! managed by a [`Registration`]. Only an activated version serves
//! requests, and activating a version evicts every other version's cache.

mod policy;
mod registration;
mod worker;

use color_eyre::Result;
use std::future::Future;

use crate::cache::{Request, Response};

pub use registration::{Registration, RegistrationEvent, ServiceRegistration};
#[cfg(test)]
pub use registration::WorkerHandle;
pub use worker::{ControlMessage, ProxySettings, WorkerState};

/// Transport used to reach the real network.
///
/// Any response the server produced, including error statuses, is `Ok`;
/// `Err` means the request never completed.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}
