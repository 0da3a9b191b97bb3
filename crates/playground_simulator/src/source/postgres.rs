//! Postgres-backed change source over `app_data.bbg_positions_stream`.

use chrono::NaiveDate;
use playground_protocol::SubscriptionKey;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{ChangeRow, ChangeSource, Snapshot, SourceError};

/// Snapshot rows: action `initial`, in stream order.
const SNAPSHOT_QUERY: &str = r#"
SELECT
    stream_order::bigint,
    msg_request_id,
    json_stream::text
FROM app_data.bbg_positions_stream
WHERE as_of_date = $1
  AND load_bb_entity_name = $2
  AND load_bb_entity_type = $3
  AND load_bb_action = 'initial'
ORDER BY stream_order"#;

/// Increment rows: same session, past the cursor, no action.
const INCREMENT_QUERY: &str = r#"
SELECT
    stream_order::bigint,
    json_stream::text
FROM app_data.bbg_positions_stream
WHERE as_of_date = $1
  AND load_bb_entity_name = $2
  AND load_bb_entity_type = $3
  AND stream_order > $4
  AND msg_request_id = $5
  AND (load_bb_action = '' OR load_bb_action IS NULL)
ORDER BY stream_order"#;

/// Change source reading the stream table through a connection pool.
#[derive(Debug, Clone)]
pub struct PgChangeSource {
    pool: PgPool,
}

impl PgChangeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool that connects on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl ChangeSource for PgChangeSource {
    async fn fetch_snapshot(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
    ) -> Result<Snapshot, SourceError> {
        let rows: Vec<(i64, Option<String>, String)> = sqlx::query_as(SNAPSHOT_QUERY)
            .bind(as_of_date)
            .bind(&key.entity_name)
            .bind(key.entity_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        let snapshot = Snapshot::from_rows(rows);
        tracing::info!(
            key = %key,
            as_of = %as_of_date,
            rows = snapshot.payloads.len(),
            last_cursor = snapshot.last_cursor,
            correlation_id = snapshot.correlation_id.as_deref().unwrap_or("(none)"),
            "Snapshot read"
        );
        Ok(snapshot)
    }

    async fn fetch_increment(
        &self,
        key: &SubscriptionKey,
        as_of_date: NaiveDate,
        correlation_id: &str,
        since_cursor: i64,
    ) -> Result<Vec<ChangeRow>, SourceError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(INCREMENT_QUERY)
            .bind(as_of_date)
            .bind(&key.entity_name)
            .bind(key.entity_type.as_str())
            .bind(since_cursor)
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;

        tracing::debug!(key = %key, since_cursor, rows = rows.len(), "Increments read");
        Ok(rows
            .into_iter()
            .map(|(cursor, payload)| ChangeRow { cursor, payload })
            .collect())
    }
}
