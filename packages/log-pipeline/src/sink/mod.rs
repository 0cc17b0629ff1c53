//! Append-only relational store for delivered log records.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::PgSink;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::types::LogRecord;

pub type RecordId = Uuid;

/// A row of the `logs` table.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedRecord {
    pub id: RecordId,
    pub payload: Bytes,
    pub inserted_at: DateTime<Utc>,
}

/// Append-only sink. Implementations must be safe for concurrent callers.
///
/// Inserting the same payload twice yields two rows; there is no
/// deduplication key.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert(&self, record: &LogRecord) -> Result<RecordId, PipelineError>;

    async fn ping(&self) -> Result<(), PipelineError>;

    async fn close(&self);
}

/// The payload as JSON text, or a constraint violation if the JSONB column
/// would reject it.
pub(crate) fn json_text(record: &LogRecord) -> Result<&str, PipelineError> {
    let text = std::str::from_utf8(record.payload())
        .map_err(|e| PipelineError::ConstraintViolation(format!("payload is not UTF-8: {e}")))?;
    serde_json::from_str::<serde::de::IgnoredAny>(text)
        .map_err(|e| PipelineError::ConstraintViolation(format!("payload is not valid JSON: {e}")))?;
    Ok(text)
}
