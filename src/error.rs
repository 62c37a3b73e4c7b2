//! Error types for the index store, ingestion pipeline, and query engine.
//!
//! Two levels exist. [`Error`] is raised to callers: a batch that fails to
//! commit, a pool that cannot hand out a session, a schema that cannot be
//! migrated. [`RecordError`] describes a single archive line that could not
//! be turned into a content entry; those are collected into
//! [`IngestStats`](crate::models::IngestStats) and never abort a file.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// No session became available within the requested timeout.
    #[error("session pool exhausted: no session available within {0:?}")]
    PoolExhausted(Duration),

    /// A write transaction failed and was rolled back.
    ///
    /// Batches committed before `batch` remain durable.
    #[error("transaction for batch {batch} failed and was rolled back: {source}")]
    Transaction {
        batch: u64,
        #[source]
        source: sqlx::Error,
    },

    /// The on-disk schema cannot be brought to the current version.
    #[error("schema migration failed: {0}")]
    SchemaMigration(String),

    /// Store access outside an ingestion batch (queries, stats, migrations).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored metadata could not be decoded.
    #[error("corrupt metadata for entry {id}: {source}")]
    CorruptMetadata {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    /// A caller passed a value outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Per-line failure recorded during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The line is not valid UTF-8 JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Searchable text or date could not be derived from the record.
    #[error("extraction error: {0}")]
    Extraction(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
