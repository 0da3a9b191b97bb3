//! Inbound loader: turns stream records into staging rows.
//!
//! The staging row layout comes from the column map, resolved once and
//! cached until [`InboundLoader::invalidate`] is called. Each column is
//! filled either from the record (`json`) or from session metadata
//! (`loader`).

use std::sync::Arc;

use chrono::NaiveDate;
use playground_protocol::SubscriptionKey;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::LoadError;
use crate::store::{ColumnMapping, InboundRow, InboundStore, MergeRequest, SourceKind};

/// Process tag written to `load_process` and passed to the merge.
pub const LOAD_PROCESS: &str = "playground-client";

/// Record attribute that scopes intraday merges.
pub const ACCOUNT_ATTRIBUTE: &str = "ACCOUNT";

/// Which phase a record arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Snapshot,
    Intraday,
}

impl LoadPhase {
    fn is_intraday(self) -> bool {
        self == LoadPhase::Intraday
    }
}

/// Session metadata attached to every loaded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSession {
    pub key: SubscriptionKey,
    pub as_of_date: NaiveDate,
    pub correlation_id: String,
}

/// Parse a record into a JSON object. Blank text is an empty object.
fn parse_record(text: &str) -> Result<Map<String, Value>, LoadError> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(text)? {
        Value::Object(object) => Ok(object),
        _ => Err(LoadError::NotAnObject),
    }
}

/// Text of a record attribute.
///
/// Looks up the upper-cased key first, then any key equal ignoring case.
/// Null and missing are `None`; strings are verbatim; other values are
/// compact JSON.
pub fn json_text(record: &Map<String, Value>, key: &str) -> Option<String> {
    let value = record
        .get(&key.to_uppercase())
        .or_else(|| {
            record
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })?;

    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn loader_value(
    column: &str,
    session: &LoadSession,
    phase: LoadPhase,
    account: Option<&str>,
) -> Option<String> {
    match column.to_lowercase().as_str() {
        "as_of_date" => Some(session.as_of_date.format("%Y-%m-%d").to_string()),
        "load_bb_entity_type" => Some(session.key.entity_type.as_str().to_string()),
        "load_bb_entity_name" => Some(session.key.entity_name.clone()),
        "load_bb_action" => match phase {
            LoadPhase::Snapshot => Some("initial".to_string()),
            LoadPhase::Intraday => None,
        },
        "load_process" => Some(LOAD_PROCESS.to_string()),
        "msg_request_id" => Some(session.correlation_id.clone()),
        "is_intraday" => Some(phase.is_intraday().to_string()),
        "account" | "account_id" => account.map(str::to_string),
        _ => None,
    }
}

/// Build one staging row aligned with `columns`.
pub fn build_row(
    columns: &[ColumnMapping],
    session: &LoadSession,
    phase: LoadPhase,
    record: &Map<String, Value>,
) -> InboundRow {
    let account = json_text(record, ACCOUNT_ATTRIBUTE);
    columns
        .iter()
        .map(|column| match column.source_kind {
            SourceKind::Json => json_text(record, &column.source_key),
            SourceKind::Loader => {
                loader_value(&column.source_key, session, phase, account.as_deref())
            }
        })
        .collect()
}

/// Loads records through an [`InboundStore`].
pub struct InboundLoader {
    store: Arc<dyn InboundStore>,
    columns: RwLock<Option<Arc<Vec<ColumnMapping>>>>,
}

impl InboundLoader {
    pub fn new(store: Arc<dyn InboundStore>) -> Self {
        Self {
            store,
            columns: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn InboundStore> {
        &self.store
    }

    /// The cached column map, resolving it on first use.
    pub async fn column_map(&self) -> Result<Arc<Vec<ColumnMapping>>, LoadError> {
        if let Some(columns) = self.columns.read().await.as_ref() {
            return Ok(Arc::clone(columns));
        }

        let mut cached = self.columns.write().await;
        if let Some(columns) = cached.as_ref() {
            return Ok(Arc::clone(columns));
        }

        let columns = self.store.load_column_map().await?;
        if columns.is_empty() {
            return Err(LoadError::EmptyColumnMap);
        }
        tracing::info!(columns = columns.len(), "Inbound column map resolved");

        let columns = Arc::new(columns);
        *cached = Some(Arc::clone(&columns));
        Ok(columns)
    }

    /// Drop the cached column map; the next load resolves it again.
    pub async fn invalidate(&self) {
        *self.columns.write().await = None;
        tracing::info!("Inbound column map cache cleared");
    }

    /// Load a whole snapshot batch and merge it unscoped.
    ///
    /// An empty batch still runs the merge.
    pub async fn load_snapshot(
        &self,
        session: &LoadSession,
        records: &[String],
    ) -> Result<usize, LoadError> {
        let columns = self.column_map().await?;
        let rows = records
            .iter()
            .map(|text| {
                let record = parse_record(text)?;
                Ok(build_row(&columns, session, LoadPhase::Snapshot, &record))
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        let merge = MergeRequest {
            is_intraday: false,
            load_process: LOAD_PROCESS.to_string(),
            as_of_date: session.as_of_date,
            account: None,
            entity_name: session.key.entity_name.clone(),
        };

        let count = rows.len();
        tracing::info!(rows = count, "Loading snapshot batch");
        self.store.load_and_merge(&columns, rows, &merge).await?;
        tracing::info!(rows = count, "Snapshot batch staged and merged");
        Ok(count)
    }

    /// Load one incremental record and merge it scoped to its account.
    pub async fn load_increment(&self, session: &LoadSession, record: &str) -> Result<(), LoadError> {
        let columns = self.column_map().await?;
        let record = parse_record(record)?;
        let row = build_row(&columns, session, LoadPhase::Intraday, &record);

        let merge = MergeRequest {
            is_intraday: true,
            load_process: LOAD_PROCESS.to_string(),
            as_of_date: session.as_of_date,
            account: json_text(&record, ACCOUNT_ATTRIBUTE),
            entity_name: session.key.entity_name.clone(),
        };

        tracing::debug!(
            account = merge.account.as_deref().unwrap_or("(null)"),
            "Loading intraday record"
        );
        self.store.load_and_merge(&columns, vec![row], &merge).await
    }

    /// Truncate staging and merged position tables.
    pub async fn reset(&self) -> Result<(), LoadError> {
        self.store.reset().await?;
        tracing::warn!("Staging and position tables truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryInboundStore;
    use playground_protocol::EntityType;
    use serde_json::json;

    fn session() -> LoadSession {
        LoadSession {
            key: SubscriptionKey::new(EntityType::Accounts, "ACC1"),
            as_of_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            correlation_id: "sess-1".to_string(),
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_json_text_lookup() {
        let record = object(json!({
            "ACCOUNT": "ACC1",
            "Security": "XS123",
            "QTY": 100,
            "PRICE": null,
            "TAGS": ["a", "b"]
        }));

        assert_eq!(json_text(&record, "account").as_deref(), Some("ACC1"));
        assert_eq!(json_text(&record, "SECURITY").as_deref(), Some("XS123"));
        assert_eq!(json_text(&record, "qty").as_deref(), Some("100"));
        assert_eq!(json_text(&record, "PRICE"), None);
        assert_eq!(json_text(&record, "MISSING"), None);
        assert_eq!(json_text(&record, "tags").as_deref(), Some(r#"["a","b"]"#));
    }

    #[test]
    fn test_json_text_prefers_upper_case_key() {
        let record = object(json!({"qty": 1, "QTY": 2}));
        assert_eq!(json_text(&record, "qty").as_deref(), Some("2"));
    }

    #[test]
    fn test_build_row_snapshot_and_intraday() {
        let columns = vec![
            ColumnMapping::loader("as_of_date"),
            ColumnMapping::loader("LOAD_BB_ENTITY_TYPE"),
            ColumnMapping::loader("load_bb_entity_name"),
            ColumnMapping::loader("load_bb_action"),
            ColumnMapping::loader("load_process"),
            ColumnMapping::loader("msg_request_id"),
            ColumnMapping::loader("is_intraday"),
            ColumnMapping::loader("account_id"),
            ColumnMapping::loader("load_bb_uuid"),
            ColumnMapping::json("ACCOUNT"),
        ];
        let record = object(json!({"ACCOUNT": "ACC9"}));

        let snapshot = build_row(&columns, &session(), LoadPhase::Snapshot, &record);
        assert_eq!(
            snapshot,
            vec![
                Some("2024-01-05".to_string()),
                Some("accounts".to_string()),
                Some("ACC1".to_string()),
                Some("initial".to_string()),
                Some(LOAD_PROCESS.to_string()),
                Some("sess-1".to_string()),
                Some("false".to_string()),
                Some("ACC9".to_string()),
                None,
                Some("ACC9".to_string()),
            ]
        );

        let intraday = build_row(&columns, &session(), LoadPhase::Intraday, &record);
        assert_eq!(intraday[3], None);
        assert_eq!(intraday[6].as_deref(), Some("true"));
    }

    #[test]
    fn test_parse_record() {
        assert!(parse_record("  ").unwrap().is_empty());
        assert!(matches!(parse_record("[1,2]"), Err(LoadError::NotAnObject)));
        assert!(matches!(parse_record("{\"A\":"), Err(LoadError::Parse(_))));
    }

    #[tokio::test]
    async fn test_column_map_is_cached_until_invalidated() {
        let store = MemoryInboundStore::with_columns(vec![ColumnMapping::json("ACCOUNT")]);
        let loader = InboundLoader::new(Arc::new(store.clone()));

        loader.column_map().await.unwrap();
        loader.column_map().await.unwrap();
        assert_eq!(store.column_map_reads().await, 1);

        store
            .set_columns(vec![ColumnMapping::json("ACCOUNT"), ColumnMapping::json("QTY")])
            .await;
        assert_eq!(loader.column_map().await.unwrap().len(), 1);

        loader.invalidate().await;
        assert_eq!(loader.column_map().await.unwrap().len(), 2);
        assert_eq!(store.column_map_reads().await, 2);
    }

    #[tokio::test]
    async fn test_empty_column_map_is_an_error_and_not_cached() {
        let store = MemoryInboundStore::default();
        let loader = InboundLoader::new(Arc::new(store.clone()));

        assert!(matches!(loader.column_map().await, Err(LoadError::EmptyColumnMap)));
        store.set_columns(vec![ColumnMapping::json("ACCOUNT")]).await;
        assert!(loader.column_map().await.is_ok());
    }

    #[tokio::test]
    async fn test_load_snapshot_runs_one_unscoped_merge() {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = InboundLoader::new(Arc::new(store.clone()));
        let records = vec![
            r#"{"ACCOUNT":"ACC1","SECURITY":"S1","QUANTITY":1}"#.to_string(),
            r#"{"ACCOUNT":"ACC1","SECURITY":"S2","QUANTITY":2}"#.to_string(),
        ];

        assert_eq!(loader.load_snapshot(&session(), &records).await.unwrap(), 2);

        let rows = store.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["SECURITY"].as_deref(), Some("S2"));
        assert_eq!(rows[0]["load_bb_action"].as_deref(), Some("initial"));

        let merges = store.merges().await;
        assert_eq!(merges.len(), 1);
        assert!(!merges[0].is_intraday);
        assert_eq!(merges[0].account, None);
        assert_eq!(merges[0].entity_name, "ACC1");
    }

    #[tokio::test]
    async fn test_empty_snapshot_still_merges() {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = InboundLoader::new(Arc::new(store.clone()));

        assert_eq!(loader.load_snapshot(&session(), &[]).await.unwrap(), 0);
        assert!(store.rows().await.is_empty());
        assert_eq!(store.merges().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_record_aborts_whole_batch() {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = InboundLoader::new(Arc::new(store.clone()));
        let records = vec![r#"{"ACCOUNT":"ACC1"}"#.to_string(), "{oops".to_string()];

        assert!(loader.load_snapshot(&session(), &records).await.is_err());
        assert!(store.rows().await.is_empty());
        assert!(store.merges().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_increment_scopes_merge_to_account() {
        let store = MemoryInboundStore::with_columns(MemoryInboundStore::playground_columns());
        let loader = InboundLoader::new(Arc::new(store.clone()));

        loader
            .load_increment(&session(), r#"{"account":"ACC7","QUANTITY":5}"#)
            .await
            .unwrap();
        loader.load_increment(&session(), r#"{"QUANTITY":6}"#).await.unwrap();

        let merges = store.merges().await;
        assert!(merges[0].is_intraday);
        assert_eq!(merges[0].account.as_deref(), Some("ACC7"));
        assert_eq!(merges[1].account, None);

        let rows = store.rows().await;
        assert_eq!(rows[0]["is_intraday"].as_deref(), Some("true"));
        assert_eq!(rows[0]["load_bb_action"], None);
        assert_eq!(rows[0]["msg_request_id"].as_deref(), Some("sess-1"));
    }
}
