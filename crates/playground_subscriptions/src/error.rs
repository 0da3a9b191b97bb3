//! Error types for the subscriptions service.

use thiserror::Error;

/// Failure while mapping, loading or merging records.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Record text is not valid JSON
    #[error("Invalid record JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Record is valid JSON but not an object
    #[error("Record is not a JSON object")]
    NotAnObject,

    /// The column map resolved to no columns
    #[error("Inbound column map is empty")]
    EmptyColumnMap,

    /// Unknown `source_kind` in the column map
    #[error("Unknown column source kind: {0}")]
    UnknownSourceKind(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Rows could not be encoded for COPY
    #[error("Row encoding error: {0}")]
    Encode(#[from] csv::Error),

    /// Staging store rejected the write
    #[error("Staging store error: {0}")]
    Store(String),
}

/// Why a subscription run ended in `Error`.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Producer answered with a non-success status
    #[error("HTTP {0}")]
    Status(u16),

    /// Request could not be sent
    #[error("Connect failed: {0}")]
    Connect(#[source] reqwest::Error),

    /// Stream URL could not be built
    #[error("Invalid stream URL: {0}")]
    Url(String),

    /// Body read failed for a reason other than connection teardown
    #[error("Stream read failed: {0}")]
    Read(String),

    /// A record could not be loaded
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),
}
