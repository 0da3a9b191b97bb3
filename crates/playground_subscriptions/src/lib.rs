//! Position stream subscriptions
//!
//! Consumes the position change stream for each subscribed account or
//! group, reassembles JSON frames from arbitrary fragments, stages the
//! records in Postgres and merges them into the position table.
//!
//! - [`reassembler`]: byte chunks to frames
//! - [`consumer`]: one stream session and its phase machine
//! - [`loader`] / [`store`]: column mapping, staging and merge
//! - [`registry`]: subscription lifecycle
//! - [`routes`] / [`server`]: management API

pub mod config;
pub mod consumer;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod reassembler;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
