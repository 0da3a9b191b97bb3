//! Position change feed simulator
//!
//! Serves an ordered change table as an HTTP stream of concatenated JSON
//! objects: snapshot rows, an end-of-snapshot heartbeat burst, then
//! increments for the same session as they appear.

pub mod config;
pub mod producer;
pub mod routes;
pub mod server;
pub mod source;

/// Simulator version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
