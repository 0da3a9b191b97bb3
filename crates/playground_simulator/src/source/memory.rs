//! In-process change table.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use playground_protocol::{EntityType, SubscriptionKey};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{ChangeRow, ChangeSource, Snapshot, SourceError};

/// One row of a JSON seed file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRow {
    pub as_of_date: NaiveDate,
    pub entity_type: EntityType,
    pub entity_name: String,
    /// `"initial"` for snapshot rows; absent or empty for increments
    #[serde(default)]
    pub action: Option<String>,
    pub cursor: i64,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
struct StoredRow {
    as_of_date: NaiveDate,
    key: SubscriptionKey,
    initial: bool,
    cursor: i64,
    correlation_id: Option<String>,
    payload: String,
}

/// Change table kept in memory.
///
/// Used by tests and by the simulator binary when no database is
/// configured. Rows can be appended while streams are open; pollers pick
/// them up on their next cycle.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeSource {
    rows: Arc<RwLock<Vec<StoredRow>>>,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows from a JSON array of [`SeedRow`].
    pub async fn from_seed_file(path: &Path) -> Result<Self, SourceError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::Seed(format!("{}: {}", path.display(), e)))?;
        let seed: Vec<SeedRow> = serde_json::from_str(&content)
            .map_err(|e| SourceError::Seed(format!("{}: {}", path.display(), e)))?;

        let source = Self::new();
        source.extend(seed).await;
        Ok(source)
    }

    pub async fn extend(&self, seed: impl IntoIterator<Item = SeedRow>) {
        let mut rows = self.rows.write().await;
        for row in seed {
            rows.push(StoredRow {
                as_of_date: row.as_of_date,
                key: SubscriptionKey::new(row.entity_type, row.entity_name),
                initial: row.action.as_deref() == Some("initial"),
                cursor: row.cursor,
                correlation_id: row.correlation_id,
                payload: row.payload.to_string(),
            });
        }
    }

    /// Add a snapshot row.
    pub async fn insert_snapshot_row(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        cursor: i64,
        correlation_id: &str,
        payload: impl Into<String>,
    ) {
        self.push(key, as_of_date, true, cursor, correlation_id, payload.into())
            .await;
    }

    /// Add an increment row.
    pub async fn append_increment(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        cursor: i64,
        correlation_id: &str,
        payload: impl Into<String>,
    ) {
        self.push(key, as_of_date, false, cursor, correlation_id, payload.into())
            .await;
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn push(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        initial: bool,
        cursor: i64,
        correlation_id: &str,
        payload: String,
    ) {
        self.rows.write().await.push(StoredRow {
            as_of_date,
            key: key.clone(),
            initial,
            cursor,
            correlation_id: Some(correlation_id.to_string()),
            payload,
        });
    }
}

#[async_trait::async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn fetch_snapshot(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
    ) -> Result<Snapshot, SourceError> {
        let rows = self.rows.read().await;
        let mut matching: Vec<_> = rows
            .iter()
            .filter(|r| r.initial && r.as_of_date == as_of_date && &r.key == key)
            .map(|r| (r.cursor, r.correlation_id.clone(), r.payload.clone()))
            .collect();
        matching.sort_by_key(|(cursor, _, _)| *cursor);

        Ok(Snapshot::from_rows(matching))
    }

    async fn fetch_increment(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        correlation_id: &str,
        since_cursor: i64,
    ) -> Result<Vec<ChangeRow>, SourceError> {
        let rows = self.rows.read().await;
        let mut matching: Vec<_> = rows
            .iter()
            .filter(|r| {
                !r.initial
                    && r.as_of_date == as_of_date
                    && &r.key == key
                    && r.cursor > since_cursor
                    && r.correlation_id.as_deref() == Some(correlation_id)
            })
            .map(|r| ChangeRow {
                cursor: r.cursor,
                payload: r.payload.clone(),
            })
            .collect();
        matching.sort_by_key(|row| row.cursor);

        Ok(matching)
    }
}
