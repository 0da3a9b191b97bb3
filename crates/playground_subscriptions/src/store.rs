//! Staging storage for inbound position records.
//!
//! A store owns the staging relation and the merge procedure that folds
//! staged rows into the position table. Each `load_and_merge` call is one
//! atomic unit: either every row is staged and merged, or nothing is.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::RwLock;

use crate::error::LoadError;

/// Literal written for SQL NULL in COPY data.
pub const COPY_NULL: &str = "\\N";

const COLUMN_MAP_QUERY: &str = r#"
SELECT DISTINCT source_column, source_kind
FROM app_config.bbg_positions_inbound_cols_map
WHERE source_kind IN ('json', 'loader')
ORDER BY source_column, source_kind"#;

const MERGE_CALL: &str = "CALL app_data.bbg_upsert_positions_from_inbound($1, $2, $3, $4, $5)";

const RESET_STATEMENT: &str =
    "TRUNCATE TABLE app_data.bbg_positions_inbound, app_data.bbg_positions RESTART IDENTITY CASCADE";

/// Where a staging column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// An attribute of the record
    Json,
    /// Session metadata computed by the loader
    Loader,
}

impl std::str::FromStr for SourceKind {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(SourceKind::Json),
            "loader" => Ok(SourceKind::Loader),
            _ => Err(LoadError::UnknownSourceKind(s.to_string())),
        }
    }
}

/// One staging column and how to fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub target_column: String,
    pub source_kind: SourceKind,
    /// Record attribute or loader field name
    pub source_key: String,
}

impl ColumnMapping {
    pub fn json(column: &str) -> Self {
        Self {
            target_column: column.to_string(),
            source_kind: SourceKind::Json,
            source_key: column.to_string(),
        }
    }

    pub fn loader(column: &str) -> Self {
        Self {
            target_column: column.to_string(),
            source_kind: SourceKind::Loader,
            source_key: column.to_string(),
        }
    }
}

/// One staging row, aligned with the column map.
pub type InboundRow = Vec<Option<String>>;

/// Arguments of the merge procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub is_intraday: bool,
    pub load_process: String,
    pub as_of_date: NaiveDate,
    /// Account scope for intraday merges; `None` merges unscoped
    pub account: Option<String>,
    pub entity_name: String,
}

/// Staging relation plus merge procedure.
#[async_trait::async_trait]
pub trait InboundStore: Send + Sync {
    /// Column map defining the staging row layout.
    async fn load_column_map(&self) -> Result<Vec<ColumnMapping>, LoadError>;

    /// Stage `rows` and run the merge, atomically.
    async fn load_and_merge(
        &self,
        columns: &[ColumnMapping],
        rows: Vec<InboundRow>,
        merge: &MergeRequest,
    ) -> Result<(), LoadError>;

    /// Truncate the staging and merged position tables.
    async fn reset(&self) -> Result<(), LoadError>;
}

/// Encode rows as CSV COPY data.
pub fn encode_copy_rows(rows: &[InboundRow]) -> Result<Vec<u8>, LoadError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row.iter().map(|value| value.as_deref().unwrap_or(COPY_NULL)))?;
    }
    writer
        .into_inner()
        .map_err(|e| LoadError::Store(e.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `COPY ... FROM STDIN` statement for the given columns.
pub fn copy_statement(columns: &[ColumnMapping]) -> String {
    let list = columns
        .iter()
        .map(|c| quote_ident(&c.target_column))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY app_data.bbg_positions_inbound ({}) FROM STDIN (FORMAT csv, NULL '{}')",
        list, COPY_NULL
    )
}

/// Postgres staging store.
#[derive(Debug, Clone)]
pub struct PgInboundStore {
    pool: PgPool,
}

impl PgInboundStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool that connects on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, LoadError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl InboundStore for PgInboundStore {
    async fn load_column_map(&self) -> Result<Vec<ColumnMapping>, LoadError> {
        let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(COLUMN_MAP_QUERY)
            .fetch_all(&self.pool)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for (column, kind) in rows {
            let (Some(column), Some(kind)) = (column, kind) else {
                continue;
            };
            if column.trim().is_empty() || kind.trim().is_empty() {
                continue;
            }
            columns.push(ColumnMapping {
                source_kind: kind.parse()?,
                source_key: column.clone(),
                target_column: column,
            });
        }
        Ok(columns)
    }

    async fn load_and_merge(
        &self,
        columns: &[ColumnMapping],
        rows: Vec<InboundRow>,
        merge: &MergeRequest,
    ) -> Result<(), LoadError> {
        let data = encode_copy_rows(&rows)?;
        let mut tx = self.pool.begin().await?;

        let mut copy = tx.copy_in_raw(&copy_statement(columns)).await?;
        copy.send(data).await?;
        let staged = copy.finish().await?;

        sqlx::query(MERGE_CALL)
            .bind(merge.is_intraday)
            .bind(&merge.load_process)
            .bind(merge.as_of_date)
            .bind(merge.account.as_deref())
            .bind(&merge.entity_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(
            staged,
            is_intraday = merge.is_intraday,
            account = merge.account.as_deref().unwrap_or("(null)"),
            "Staged and merged"
        );
        Ok(())
    }

    async fn reset(&self) -> Result<(), LoadError> {
        sqlx::query(RESET_STATEMENT).execute(&self.pool).await?;
        Ok(())
    }
}

/// A staged row keyed by column name.
pub type StagedRow = BTreeMap<String, Option<String>>;

#[derive(Debug, Default)]
struct MemoryState {
    columns: Vec<ColumnMapping>,
    column_map_reads: usize,
    rows: Vec<StagedRow>,
    merges: Vec<MergeRequest>,
    /// Successful calls left before injected failures start
    fail_after: Option<(usize, String)>,
}

/// In-process staging store for tests and database-less runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryInboundStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryInboundStore {
    pub fn with_columns(columns: Vec<ColumnMapping>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                columns,
                ..Default::default()
            })),
        }
    }

    /// Column layout of the playground staging table.
    pub fn playground_columns() -> Vec<ColumnMapping> {
        vec![
            ColumnMapping::loader("as_of_date"),
            ColumnMapping::loader("load_bb_entity_type"),
            ColumnMapping::loader("load_bb_entity_name"),
            ColumnMapping::loader("load_bb_action"),
            ColumnMapping::loader("load_process"),
            ColumnMapping::loader("msg_request_id"),
            ColumnMapping::loader("is_intraday"),
            ColumnMapping::json("ACCOUNT"),
            ColumnMapping::json("SECURITY"),
            ColumnMapping::json("QUANTITY"),
        ]
    }

    pub async fn set_columns(&self, columns: Vec<ColumnMapping>) {
        self.state.write().await.columns = columns;
    }

    /// Let `successes` more loads through, then fail every load with `message`.
    pub async fn fail_after(&self, successes: usize, message: impl Into<String>) {
        self.state.write().await.fail_after = Some((successes, message.into()));
    }

    pub async fn rows(&self) -> Vec<StagedRow> {
        self.state.read().await.rows.clone()
    }

    pub async fn merges(&self) -> Vec<MergeRequest> {
        self.state.read().await.merges.clone()
    }

    pub async fn column_map_reads(&self) -> usize {
        self.state.read().await.column_map_reads
    }
}

#[async_trait::async_trait]
impl InboundStore for MemoryInboundStore {
    async fn load_column_map(&self) -> Result<Vec<ColumnMapping>, LoadError> {
        let mut state = self.state.write().await;
        state.column_map_reads += 1;
        Ok(state.columns.clone())
    }

    async fn load_and_merge(
        &self,
        columns: &[ColumnMapping],
        rows: Vec<InboundRow>,
        merge: &MergeRequest,
    ) -> Result<(), LoadError> {
        let mut state = self.state.write().await;

        if let Some((remaining, message)) = state.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(LoadError::Store(message.clone()));
            }
            *remaining -= 1;
        }

        for row in &rows {
            if row.len() != columns.len() {
                return Err(LoadError::Store(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
        }
        let staged: Vec<StagedRow> = rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| c.target_column.clone())
                    .zip(row)
                    .collect()
            })
            .collect();

        state.rows.extend(staged);
        state.merges.push(merge.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<(), LoadError> {
        let mut state = self.state.write().await;
        state.rows.clear();
        state.merges.clear();
        Ok(())
    }
}
