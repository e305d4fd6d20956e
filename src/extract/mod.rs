//! Source extraction seam
//!
//! Extraction is an external collaborator: the engine only requires that an
//! extractor is deterministic for a given `as_of` date. `MemoryExtractor`
//! backs tests and dry runs; `SqlExtractor` (`database` feature) reads a
//! whole source table or view through sqlx.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::MappingConfig;
use crate::error::{ConnectionError, EtlError, EtlResult};
use crate::model::SourceRow;

/// `extract` returns the mapping's source rows in a stable order
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, mapping: &MappingConfig, as_of: NaiveDate)
        -> EtlResult<Vec<SourceRow>>;
}

/// In-memory extractor keyed by source table name
#[derive(Default)]
pub struct MemoryExtractor {
    tables: HashMap<String, Vec<SourceRow>>,
}

impl MemoryExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        self.tables.insert(table.into(), rows);
        self
    }

    pub fn set_table(&mut self, table: impl Into<String>, rows: Vec<SourceRow>) {
        self.tables.insert(table.into(), rows);
    }
}

#[async_trait]
impl Extractor for MemoryExtractor {
    async fn extract(
        &self,
        mapping: &MappingConfig,
        _as_of: NaiveDate,
    ) -> EtlResult<Vec<SourceRow>> {
        match self.tables.get(&mapping.source_table) {
            Some(rows) => Ok(rows.clone()),
            None => Err(EtlError::Connection(ConnectionError::SourceUnavailable {
                source_table: mapping.source_table.clone(),
                message: "no such table registered".to_string(),
            })),
        }
    }
}

#[cfg(feature = "database")]
mod sql {
    use super::*;
    use serde_json::Value;
    use sqlx::PgPool;

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Reads every row of the mapping's source table. Determinism for a
    /// given `as_of` is the responsibility of the source view, which is
    /// expected to be snapshot-consistent per batch date.
    pub struct SqlExtractor {
        pool: PgPool,
    }

    impl SqlExtractor {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl Extractor for SqlExtractor {
        async fn extract(
            &self,
            mapping: &MappingConfig,
            _as_of: NaiveDate,
        ) -> EtlResult<Vec<SourceRow>> {
            let sql = format!(
                "SELECT row_to_json(t) FROM {} t",
                quote_ident(&mapping.source_table)
            );
            let rows: Vec<(Value,)> = sqlx::query_as(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    EtlError::Connection(ConnectionError::SourceUnavailable {
                        source_table: mapping.source_table.clone(),
                        message: e.to_string(),
                    })
                })?;

            Ok(rows
                .into_iter()
                .map(|(value,)| match value {
                    Value::Object(fields) => SourceRow::from_pairs(fields),
                    _ => SourceRow::new(),
                })
                .collect())
        }
    }
}

#[cfg(feature = "database")]
pub use sql::SqlExtractor;
