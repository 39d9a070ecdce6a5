//! Named, versioned response caches.
//!
//! A cache is a set of request → response entries under a name such as
//! `erp-cache-v3`. The proxy keeps one cache per deployed version and evicts
//! the others when a version activates.

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::{CacheStorage, Request, Response};
