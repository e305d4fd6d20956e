//! Core data model for the dimensional ETL engine
//!
//! Rows move through the pipeline as typed records: `SourceRow` (extracted),
//! `DimensionRow` (versioned dimension member), `FactRow` (fully-resolved
//! fact). `ExecutionRecord` and `ValidationResult` carry the audit and
//! validation surfaces.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SchemaMismatchError;

/// Generic loaded record as the sink stores it: target column -> value
pub type Record = BTreeMap<String, Value>;

/// Reserved surrogate key substituted when a foreign key cannot be resolved.
pub const UNKNOWN_KEY: i64 = -1;

/// Date key for a missing date. Always considered inside the calendar range.
pub const NULL_DATE_KEY: i32 = 0;

/// Convert a date to its `YYYYMMDD` integer key. `None` maps to
/// [`NULL_DATE_KEY`], never an error.
pub fn date_key(date: Option<NaiveDate>) -> i32 {
    use chrono::Datelike;
    match date {
        Some(d) => d.year() * 10_000 + d.month() as i32 * 100 + d.day() as i32,
        None => NULL_DATE_KEY,
    }
}

/// One record extracted from a source mapping: column name -> typed value.
///
/// Columns are kept in a BTreeMap so iteration order (and therefore the
/// SCD2 change hash) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    columns: BTreeMap<String, Value>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from (column, value) pairs
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            columns: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    /// Whether the column is absent, JSON null, or an empty string
    pub fn is_missing(&self, column: &str) -> bool {
        match self.columns.get(column) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        }
    }

    /// Fetch a declared column, failing with a schema mismatch if absent
    pub fn require(&self, column: &str, mapping: &str) -> Result<&Value, SchemaMismatchError> {
        self.columns
            .get(column)
            .ok_or_else(|| SchemaMismatchError::MissingColumn {
                column: column.to_string(),
                mapping: mapping.to_string(),
            })
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Value::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(Value::as_i64)
    }

    /// Numeric value as a Decimal. Numbers are converted through their
    /// string form so float artifacts never reach a financial measure.
    pub fn get_decimal(&self, column: &str) -> Option<Decimal> {
        match self.columns.get(column)? {
            Value::Number(n) => n.to_string().parse().ok(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Date value parsed from an ISO `YYYY-MM-DD` string
    pub fn get_date(&self, column: &str) -> Option<NaiveDate> {
        self.get_str(column)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.columns.get(column).and_then(Value::as_bool)
    }

    /// Column map view, used by the rule-expression interpreter
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.columns
    }
}

/// One versioned member of a dimension.
///
/// Invariants maintained by the dimension loader and checked by the
/// business-rule validator: exactly one row per natural key has
/// `is_current == true` and `valid_to == None`; `version_number` increases
/// from 1 without gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRow {
    pub natural_key: String,
    pub surrogate_key: i64,
    pub attributes: BTreeMap<String, Value>,
    pub version_number: i32,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub is_current: bool,
}

impl DimensionRow {
    /// First version of a freshly-seen natural key
    pub fn initial(
        natural_key: impl Into<String>,
        surrogate_key: i64,
        attributes: BTreeMap<String, Value>,
        valid_from: NaiveDate,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            surrogate_key,
            attributes,
            version_number: 1,
            valid_from,
            valid_to: None,
            is_current: true,
        }
    }

    /// Successor version after an attribute change
    pub fn successor(
        &self,
        surrogate_key: i64,
        attributes: BTreeMap<String, Value>,
        valid_from: NaiveDate,
    ) -> Self {
        Self {
            natural_key: self.natural_key.clone(),
            surrogate_key,
            attributes,
            version_number: self.version_number + 1,
            valid_from,
            valid_to: None,
            is_current: true,
        }
    }
}

/// One fully-resolved fact record ready for bulk load.
///
/// Every entry in `dimension_keys` is either a surrogate key present in the
/// referenced dimension or [`UNKNOWN_KEY`]; never absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    /// dimension name -> resolved surrogate key
    pub dimension_keys: BTreeMap<String, i64>,
    /// date role -> YYYYMMDD key (0 for missing dates)
    pub date_keys: BTreeMap<String, i32>,
    /// operational identifiers carried without a dimension
    pub degenerate_ids: BTreeMap<String, String>,
    /// additive financial measures; never null, defaulted to zero
    pub measures: BTreeMap<String, Decimal>,
    /// tri-state flags where the source is genuinely unknown
    pub flags: BTreeMap<String, Option<bool>>,
}

/// Status of one mapping execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    /// Descendant of a failed task under `stop_on_error`; never started
    Skipped,
}

/// Row counts emitted by a mapping execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub extracted: u64,
    pub validated: u64,
    pub rejected: u64,
    pub loaded: u64,
}

/// Append-only record of one mapping run. Created at task start, sealed at
/// task end, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub mapping_id: String,
    pub execution_start: DateTime<Utc>,
    pub execution_end: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub rows_extracted: u64,
    pub rows_validated: u64,
    pub rows_rejected: u64,
    pub rows_loaded: u64,
    pub error_message: Option<String>,
}

impl ExecutionRecord {
    pub fn open(mapping_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            mapping_id: mapping_id.into(),
            execution_start: Utc::now(),
            execution_end: None,
            status: ExecutionStatus::Running,
            rows_extracted: 0,
            rows_validated: 0,
            rows_rejected: 0,
            rows_loaded: 0,
            error_message: None,
        }
    }

    /// Seal the record with its final status and counts
    pub fn seal(mut self, status: ExecutionStatus, counts: RowCounts, error: Option<String>) -> Self {
        self.execution_end = Some(Utc::now());
        self.status = status;
        self.rows_extracted = counts.extracted;
        self.rows_validated = counts.validated;
        self.rows_rejected = counts.rejected;
        self.rows_loaded = counts.loaded;
        self.error_message = error;
        self
    }
}

/// Outcome of one validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pass,
    Fail,
    Warn,
}

/// One named validation check with structured details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check_name: String,
    pub status: ValidationStatus,
    pub details: Value,
}

impl ValidationResult {
    pub fn pass(check_name: impl Into<String>, details: Value) -> Self {
        Self {
            check_name: check_name.into(),
            status: ValidationStatus::Pass,
            details,
        }
    }

    pub fn fail(check_name: impl Into<String>, details: Value) -> Self {
        Self {
            check_name: check_name.into(),
            status: ValidationStatus::Fail,
            details,
        }
    }

    pub fn warn(check_name: impl Into<String>, details: Value) -> Self {
        Self {
            check_name: check_name.into(),
            status: ValidationStatus::Warn,
            details,
        }
    }
}
