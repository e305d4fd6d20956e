//! Target warehouse seam
//!
//! The engine writes through this trait only. `MemorySink` backs tests and
//! dry runs and can inject a mid-load failure to exercise the all-or-nothing
//! guarantee; `PostgresSink` (`database` feature) writes through sqlx with
//! every table swap and dimension plan in a single transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::dimension::DimensionLoadPlan;
use crate::error::{ConnectionError, EtlError, EtlResult};
use crate::model::{DimensionRow, Record};

/// Write/read surface of the target warehouse
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append rows to a table (INCREMENTAL strategy)
    async fn bulk_load(&self, table: &str, rows: Vec<Record>) -> EtlResult<u64>;

    /// Full reload: truncate and load all chunks, visible only if every
    /// chunk succeeds. An interrupted swap leaves the table untouched.
    async fn swap_load(&self, table: &str, rows: Vec<Record>, chunk_size: usize)
        -> EtlResult<u64>;

    async fn truncate(&self, table: &str) -> EtlResult<()>;

    /// Apply a dimension plan: expirations, upsert overwrites and inserts
    /// in the same transaction
    async fn apply_dimension_plan(&self, table: &str, plan: &DimensionLoadPlan) -> EtlResult<()>;

    /// Current rows of a dimension table (`is_current = true`)
    async fn fetch_current_dimension(&self, table: &str) -> EtlResult<Vec<DimensionRow>>;

    /// Every version row of a dimension table
    async fn fetch_dimension_history(&self, table: &str) -> EtlResult<Vec<DimensionRow>>;

    /// All rows of a table in generic record form
    async fn fetch_rows(&self, table: &str) -> EtlResult<Vec<Record>>;

    async fn count(&self, table: &str) -> EtlResult<u64>;
}

/// Flatten a dimension row to its generic record shape
pub fn dimension_record(row: &DimensionRow) -> Record {
    let mut record: Record = row.attributes.clone();
    record.insert(
        "surrogate_key".to_string(),
        Value::Number(row.surrogate_key.into()),
    );
    record.insert(
        "natural_key".to_string(),
        Value::String(row.natural_key.clone()),
    );
    record.insert(
        "version_number".to_string(),
        Value::Number(row.version_number.into()),
    );
    record.insert(
        "valid_from".to_string(),
        Value::String(row.valid_from.to_string()),
    );
    record.insert(
        "valid_to".to_string(),
        match &row.valid_to {
            Some(d) => Value::String(d.to_string()),
            None => Value::Null,
        },
    );
    record.insert("is_current".to_string(), Value::Bool(row.is_current));
    record
}

#[derive(Default)]
struct MemorySinkState {
    tables: HashMap<String, Vec<Record>>,
    dimensions: HashMap<String, Vec<DimensionRow>>,
    /// table -> chunk index at which swap_load fails
    fail_swap_at_chunk: HashMap<String, usize>,
    fail_dimension_apply: HashMap<String, bool>,
}

/// In-memory sink for tests and dry runs
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `swap_load` on `table` fail when it reaches the given
    /// chunk index. The visible table must remain untouched.
    pub async fn fail_swap_at_chunk(&self, table: impl Into<String>, chunk_index: usize) {
        let mut state = self.state.lock().await;
        state.fail_swap_at_chunk.insert(table.into(), chunk_index);
    }

    /// Make the next dimension plan application on `table` fail before any
    /// write becomes visible.
    pub async fn fail_dimension_apply(&self, table: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.fail_dimension_apply.insert(table.into(), true);
    }

    /// Seed a dimension table directly, e.g. pre-provisioned rows
    pub async fn seed_dimension(&self, table: impl Into<String>, rows: Vec<DimensionRow>) {
        let mut state = self.state.lock().await;
        state.dimensions.insert(table.into(), rows);
    }
}

fn target_error(table: &str, message: impl Into<String>) -> EtlError {
    EtlError::Connection(ConnectionError::TargetUnavailable {
        target_table: table.to_string(),
        message: message.into(),
    })
}

#[async_trait]
impl Sink for MemorySink {
    async fn bulk_load(&self, table: &str, rows: Vec<Record>) -> EtlResult<u64> {
        let mut state = self.state.lock().await;
        let count = rows.len() as u64;
        state.tables.entry(table.to_string()).or_default().extend(rows);
        Ok(count)
    }

    async fn swap_load(
        &self,
        table: &str,
        rows: Vec<Record>,
        chunk_size: usize,
    ) -> EtlResult<u64> {
        let chunk_size = chunk_size.max(1);
        let mut state = self.state.lock().await;
        let fail_at = state.fail_swap_at_chunk.remove(table);

        // Staging buffer: the visible table is only replaced after the
        // final chunk lands.
        let mut staged: Vec<Record> = Vec::with_capacity(rows.len());
        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            if fail_at.is_some_and(|at| index >= at) {
                return Err(target_error(table, format!("injected failure at chunk {index}")));
            }
            staged.extend(chunk.iter().cloned());
        }

        let count = staged.len() as u64;
        state.tables.insert(table.to_string(), staged);
        Ok(count)
    }

    async fn truncate(&self, table: &str) -> EtlResult<()> {
        let mut state = self.state.lock().await;
        state.tables.insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn apply_dimension_plan(&self, table: &str, plan: &DimensionLoadPlan) -> EtlResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_dimension_apply.remove(table).unwrap_or(false) {
            return Err(target_error(table, "injected failure before commit"));
        }

        // Mutate a copy and commit at the end, as a transaction would
        let mut rows = state.dimensions.get(table).cloned().unwrap_or_default();

        for expiration in &plan.expirations {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.surrogate_key == expiration.surrogate_key)
            {
                row.is_current = false;
                row.valid_to = Some(expiration.valid_to);
            }
        }

        for upsert in &plan.upserts {
            match rows
                .iter_mut()
                .find(|r| r.surrogate_key == upsert.surrogate_key)
            {
                Some(row) => *row = upsert.clone(),
                None => rows.push(upsert.clone()),
            }
        }

        rows.extend(plan.inserts.iter().cloned());
        state.dimensions.insert(table.to_string(), rows);
        Ok(())
    }

    async fn fetch_current_dimension(&self, table: &str) -> EtlResult<Vec<DimensionRow>> {
        let state = self.state.lock().await;
        Ok(state
            .dimensions
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.is_current).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_dimension_history(&self, table: &str) -> EtlResult<Vec<DimensionRow>> {
        let state = self.state.lock().await;
        Ok(state.dimensions.get(table).cloned().unwrap_or_default())
    }

    async fn fetch_rows(&self, table: &str) -> EtlResult<Vec<Record>> {
        let state = self.state.lock().await;
        if let Some(rows) = state.dimensions.get(table) {
            return Ok(rows.iter().map(dimension_record).collect());
        }
        Ok(state.tables.get(table).cloned().unwrap_or_default())
    }

    async fn count(&self, table: &str) -> EtlResult<u64> {
        let state = self.state.lock().await;
        if let Some(rows) = state.dimensions.get(table) {
            return Ok(rows.len() as u64);
        }
        Ok(state.tables.get(table).map(Vec::len).unwrap_or(0) as u64)
    }
}

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{PgPool, Postgres, Transaction};
    use std::collections::BTreeMap;

    /// Quote an identifier for interpolation into generated SQL
    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn db_error(table: &str, e: sqlx::Error) -> EtlError {
        target_error(table, e.to_string())
    }

    /// Postgres-backed sink. Generic loads go through
    /// `jsonb_populate_recordset`, which types every column from the target
    /// table's row type.
    pub struct PostgresSink {
        pool: PgPool,
    }

    impl PostgresSink {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn insert_records(
            tx: &mut Transaction<'_, Postgres>,
            table: &str,
            rows: &[Record],
        ) -> EtlResult<()> {
            let payload = Value::Array(
                rows.iter()
                    .map(|r| Value::Object(r.clone().into_iter().collect()))
                    .collect(),
            );
            let sql = format!(
                "INSERT INTO {t} SELECT * FROM jsonb_populate_recordset(NULL::{t}, $1)",
                t = quote_ident(table)
            );
            sqlx::query(&sql)
                .bind(payload)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error(table, e))?;
            Ok(())
        }

        fn parse_dimension_row(table: &str, value: Value) -> EtlResult<DimensionRow> {
            let Value::Object(mut fields) = value else {
                return Err(target_error(table, "dimension row is not an object"));
            };

            let surrogate_key = fields
                .remove("surrogate_key")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| target_error(table, "missing surrogate_key"))?;
            let natural_key = match fields.remove("natural_key") {
                Some(Value::String(s)) => s,
                _ => return Err(target_error(table, "missing natural_key")),
            };
            let version_number = fields
                .remove("version_number")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| target_error(table, "missing version_number"))?
                as i32;
            let valid_from = match fields.remove("valid_from") {
                Some(Value::String(s)) => s
                    .parse()
                    .map_err(|_| target_error(table, "invalid valid_from"))?,
                _ => return Err(target_error(table, "missing valid_from")),
            };
            let valid_to = match fields.remove("valid_to") {
                Some(Value::String(s)) => Some(
                    s.parse()
                        .map_err(|_| target_error(table, "invalid valid_to"))?,
                ),
                _ => None,
            };
            let is_current = fields
                .remove("is_current")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| target_error(table, "missing is_current"))?;

            Ok(DimensionRow {
                natural_key,
                surrogate_key,
                attributes: fields.into_iter().collect::<BTreeMap<_, _>>(),
                version_number,
                valid_from,
                valid_to,
                is_current,
            })
        }

        async fn fetch_dimension_where(
            &self,
            table: &str,
            current_only: bool,
        ) -> EtlResult<Vec<DimensionRow>> {
            let mut sql = format!("SELECT row_to_json(t) FROM {} t", quote_ident(table));
            if current_only {
                sql.push_str(" WHERE is_current = true");
            }
            let rows: Vec<(Value,)> = sqlx::query_as(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error(table, e))?;

            rows.into_iter()
                .map(|(v,)| Self::parse_dimension_row(table, v))
                .collect()
        }
    }

    #[async_trait]
    impl Sink for PostgresSink {
        async fn bulk_load(&self, table: &str, rows: Vec<Record>) -> EtlResult<u64> {
            let count = rows.len() as u64;
            let mut tx = self.pool.begin().await.map_err(|e| db_error(table, e))?;
            Self::insert_records(&mut tx, table, &rows).await?;
            tx.commit().await.map_err(|e| db_error(table, e))?;
            Ok(count)
        }

        async fn swap_load(
            &self,
            table: &str,
            rows: Vec<Record>,
            chunk_size: usize,
        ) -> EtlResult<u64> {
            let chunk_size = chunk_size.max(1);
            let count = rows.len() as u64;

            let mut tx = self.pool.begin().await.map_err(|e| db_error(table, e))?;
            sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error(table, e))?;
            for chunk in rows.chunks(chunk_size) {
                Self::insert_records(&mut tx, table, chunk).await?;
            }
            tx.commit().await.map_err(|e| db_error(table, e))?;
            Ok(count)
        }

        async fn truncate(&self, table: &str) -> EtlResult<()> {
            sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
                .execute(&self.pool)
                .await
                .map_err(|e| db_error(table, e))?;
            Ok(())
        }

        async fn apply_dimension_plan(
            &self,
            table: &str,
            plan: &DimensionLoadPlan,
        ) -> EtlResult<()> {
            let mut tx = self.pool.begin().await.map_err(|e| db_error(table, e))?;

            for expiration in &plan.expirations {
                let sql = format!(
                    "UPDATE {} SET is_current = false, valid_to = $1 WHERE surrogate_key = $2",
                    quote_ident(table)
                );
                sqlx::query(&sql)
                    .bind(expiration.valid_to)
                    .bind(expiration.surrogate_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error(table, e))?;
            }

            // Type 1 overwrite: replace the whole row, keeping its key
            if !plan.upserts.is_empty() {
                let keys: Vec<i64> = plan.upserts.iter().map(|r| r.surrogate_key).collect();
                let sql = format!(
                    "DELETE FROM {} WHERE surrogate_key = ANY($1)",
                    quote_ident(table)
                );
                sqlx::query(&sql)
                    .bind(&keys)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error(table, e))?;
                let records: Vec<Record> = plan.upserts.iter().map(dimension_record).collect();
                Self::insert_records(&mut tx, table, &records).await?;
            }

            if !plan.inserts.is_empty() {
                let records: Vec<Record> = plan.inserts.iter().map(dimension_record).collect();
                Self::insert_records(&mut tx, table, &records).await?;
            }

            tx.commit().await.map_err(|e| db_error(table, e))?;
            Ok(())
        }

        async fn fetch_current_dimension(&self, table: &str) -> EtlResult<Vec<DimensionRow>> {
            self.fetch_dimension_where(table, true).await
        }

        async fn fetch_dimension_history(&self, table: &str) -> EtlResult<Vec<DimensionRow>> {
            self.fetch_dimension_where(table, false).await
        }

        async fn fetch_rows(&self, table: &str) -> EtlResult<Vec<Record>> {
            let sql = format!("SELECT row_to_json(t) FROM {} t", quote_ident(table));
            let rows: Vec<(Value,)> = sqlx::query_as(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error(table, e))?;

            Ok(rows
                .into_iter()
                .map(|(v,)| match v {
                    Value::Object(fields) => fields.into_iter().collect(),
                    _ => Record::new(),
                })
                .collect())
        }

        async fn count(&self, table: &str) -> EtlResult<u64> {
            let row: (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| db_error(table, e))?;
            Ok(row.0 as u64)
        }
    }
}

#[cfg(feature = "database")]
pub use postgres::PostgresSink;
