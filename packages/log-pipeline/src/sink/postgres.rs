use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{json_text, RecordId, RecordSink};
use crate::error::PipelineError;
use crate::types::LogRecord;

const CREATE_LOGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS logs (\
     id UUID PRIMARY KEY DEFAULT gen_random_uuid(), \
     data JSONB NOT NULL, \
     inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";

const INSERT_LOG: &str = "INSERT INTO logs (data) VALUES ($1::jsonb) RETURNING id";

/// PostgreSQL sink backed by a connection pool: each concurrent insert runs
/// on its own connection.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        info!(max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(classify)?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create the `logs` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), PipelineError> {
        sqlx::query(CREATE_LOGS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        debug!("logs table ready");
        Ok(())
    }
}

/// Map a driver error onto the sink taxonomy.
///
/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint) depend
/// on the payload and will fail again on retry. Everything else is treated as
/// the store being unreachable.
fn classify(e: sqlx::Error) -> PipelineError {
    match &e {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("22") || code.starts_with("23") => {
                PipelineError::ConstraintViolation(db.message().to_string())
            }
            _ => PipelineError::SinkUnavailable(e.to_string()),
        },
        _ => PipelineError::SinkUnavailable(e.to_string()),
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn insert(&self, record: &LogRecord) -> Result<RecordId, PipelineError> {
        let text = json_text(record)?;
        sqlx::query_scalar::<_, RecordId>(INSERT_LOG)
            .bind(text)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}
