//! # playground_protocol: Position Stream Wire Protocol
//!
//! Shared vocabulary for the position stream simulator and the
//! subscriptions service:
//!
//! - Subscription identity: [`EntityType`], [`SubscriptionKey`] (`key`)
//! - Frame classification: [`StreamFrame`] (`frame`)
//! - Route, header and query names used on the wire (this module)
//! - Service log verbosity: [`LogLevel`] (`log_level`)
//!
//! The stream itself is an unbounded sequence of concatenated JSON objects
//! with no delimiter, no length prefix and no enclosing array. The literal
//! empty object [`HEARTBEAT`] is a keepalive; its first occurrence after a
//! snapshot marks the end of that snapshot.
//!
//! ## Usage Examples
//!
//! ```rust
//! use playground_protocol::{subscription_segments, EntityType, SubscriptionKey};
//!
//! let key = SubscriptionKey::new(EntityType::Accounts, "ACC1");
//! assert_eq!(
//!     subscription_segments(&key).join("/"),
//!     "trading-solutions/positions/accounts/ACC1/subscriptions"
//! );
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod frame;
pub mod key;
pub mod log_level;

pub use error::ProtocolError;
pub use frame::StreamFrame;
pub use key::{EntityType, SubscriptionKey};
pub use log_level::{LogLevel, UnknownLogLevel};

/// Heartbeat sentinel: the literal two-character empty object.
pub const HEARTBEAT: &str = "{}";

/// Response header carrying the session correlation id.
pub const CORRELATION_HEADER: &str = "X-Request-ID";

/// Query parameter selecting the as-of date (`YYYY-MM-DD`).
pub const AS_OF_DATE_PARAM: &str = "as_of_date";

/// Query parameter enabling fragmentation emulation on the producer.
pub const CHUNK_PARAM: &str = "chunk";

/// Content type of the stream response.
pub const STREAM_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Route template served by the producer, in axum path syntax.
pub const SUBSCRIPTION_ROUTE: &str =
    "/trading-solutions/positions/{entity_type}/{entity_name}/subscriptions";

/// Unencoded path segments of the stream route for a key.
///
/// The entity name may contain any character, including `/`, `?`, `#` and
/// `%`. Callers must percent-encode each segment on its own, never the
/// joined string.
pub fn subscription_segments(key: &SubscriptionKey) -> [&str; 5] {
    [
        "trading-solutions",
        "positions",
        key.entity_type.as_str(),
        key.entity_name.as_str(),
        "subscriptions",
    ]
}
