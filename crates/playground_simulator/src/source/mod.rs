//! Change source readers.
//!
//! A change source holds the ordered change table the simulator replays:
//! snapshot rows (action `initial`) followed by increments that share the
//! snapshot's correlation id and carry ever larger cursors.

mod memory;
mod postgres;

pub use memory::{MemoryChangeSource, SeedRow};
pub use postgres::PgChangeSource;

use chrono::NaiveDate;
use playground_protocol::SubscriptionKey;
use thiserror::Error;

/// Change source error type
#[derive(Debug, Error)]
pub enum SourceError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Seed data could not be read or parsed
    #[error("Seed data error: {0}")]
    Seed(String),
}

/// One increment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    /// Position in the session's ordering
    pub cursor: i64,
    /// JSON object text
    pub payload: String,
}

/// Result of a snapshot read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Cursor of the last snapshot row (0 when empty)
    pub last_cursor: i64,
    /// Correlation id of the session, absent when no rows exist
    pub correlation_id: Option<String>,
    /// JSON object texts in cursor order
    pub payloads: Vec<String>,
}

impl Snapshot {
    /// Build a snapshot from `(cursor, correlation id, payload)` rows already
    /// sorted by cursor. Cursor and correlation id come from the last row.
    pub fn from_rows(rows: Vec<(i64, Option<String>, String)>) -> Self {
        let Some((last_cursor, correlation_id, _)) = rows.last().cloned() else {
            return Self::default();
        };
        Self {
            last_cursor,
            correlation_id: correlation_id.filter(|id| !id.trim().is_empty()),
            payloads: rows.into_iter().map(|(_, _, payload)| payload).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// Reader over an ordered change table.
#[async_trait::async_trait]
pub trait ChangeSource: Send + Sync {
    /// All snapshot rows for the key and date, in cursor order.
    async fn fetch_snapshot(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
    ) -> Result<Snapshot, SourceError>;

    /// Increment rows with `cursor > since_cursor` for the same session,
    /// in ascending cursor order.
    async fn fetch_increment(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        correlation_id: &str,
        since_cursor: i64,
    ) -> Result<Vec<ChangeRow>, SourceError>;
}
