//! Execution audit: append-only record of every mapping run
//!
//! One record per run per mapping. A record is opened when the task starts,
//! sealed exactly once when it ends, and never mutated afterwards. Each task
//! is the sole writer of its own record, so no cross-task coordination is
//! needed beyond the append itself.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::EtlResult;
use crate::model::ExecutionRecord;

/// Append-only audit surface
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Persist a sealed record
    async fn append(&self, record: &ExecutionRecord) -> EtlResult<()>;
}

/// In-memory audit log for tests, dry runs, and report assembly
#[derive(Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, record: &ExecutionRecord) -> EtlResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Postgres audit log over `etl_execution_audit`
#[cfg(feature = "database")]
pub struct PostgresAuditLog {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PostgresAuditLog {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl AuditLog for PostgresAuditLog {
    async fn append(&self, record: &ExecutionRecord) -> EtlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_execution_audit (
                execution_id, mapping_id, execution_start, execution_end,
                status, rows_extracted, rows_validated, rows_rejected,
                rows_loaded, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.execution_id)
        .bind(&record.mapping_id)
        .bind(record.execution_start)
        .bind(record.execution_end)
        .bind(format!("{:?}", record.status).to_uppercase())
        .bind(record.rows_extracted as i64)
        .bind(record.rows_validated as i64)
        .bind(record.rows_rejected as i64)
        .bind(record.rows_loaded as i64)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            crate::error::EtlError::Connection(crate::error::ConnectionError::TargetUnavailable {
                target_table: "etl_execution_audit".to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(())
    }
}
