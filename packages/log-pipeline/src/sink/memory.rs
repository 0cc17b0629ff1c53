use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{json_text, PersistedRecord, RecordId, RecordSink};
use crate::error::PipelineError;
use crate::types::LogRecord;

#[derive(Default)]
struct Inner {
    rows: Mutex<Vec<PersistedRecord>>,
    unavailable: AtomicBool,
    attempts: AtomicU64,
    insert_delay: Mutex<Duration>,
}

/// In-process stand-in for the `logs` table. Rejects non-JSON payloads the
/// way a JSONB column does.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Inner>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Latency added to every insert.
    pub fn set_insert_delay(&self, delay: Duration) {
        *self
            .inner
            .insert_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn rows(&self) -> Vec<PersistedRecord> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of insert calls, successful or not.
    pub fn insert_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert(&self, record: &LogRecord) -> Result<RecordId, PipelineError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .inner
            .insert_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::SinkUnavailable("connection refused".into()));
        }
        json_text(record)?;

        let row = PersistedRecord {
            id: Uuid::new_v4(),
            payload: record.payload().clone(),
            inserted_at: Utc::now(),
        };
        let id = row.id;
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
        Ok(id)
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(PipelineError::SinkUnavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_payloads_get_distinct_ids() {
        let sink = MemorySink::new();
        let record = LogRecord::new(&br#"{"level":"info"}"#[..]);

        let first = sink.insert(&record).await.unwrap();
        let second = sink.insert(&record).await.unwrap();

        assert_ne!(first, second);
        let rows = sink.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload, rows[1].payload);
    }

    #[tokio::test]
    async fn invalid_json_is_a_constraint_violation() {
        let sink = MemorySink::new();
        let err = sink
            .insert(&LogRecord::new(&b"{\"unterminated\":"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConstraintViolation(_)));
        assert!(sink.rows().is_empty());
    }

    #[tokio::test]
    async fn unavailable_sink_stores_nothing() {
        let sink = MemorySink::new();
        sink.set_available(false);
        let err = sink.insert(&LogRecord::new(&b"{}"[..])).await.unwrap_err();
        assert!(matches!(err, PipelineError::SinkUnavailable(_)));
        assert!(sink.ping().await.is_err());
        assert_eq!(sink.insert_attempts(), 1);
    }
}
