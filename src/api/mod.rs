//! Remote ERP API: HTTP client, wire types and the offline-aware write path.

pub mod client;
pub mod types;
pub mod writes;

pub use client::ApiClient;
pub use writes::submit_write;
