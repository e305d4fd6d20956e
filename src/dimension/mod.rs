//! Dimension maintenance: SCD Type 1/2 planning and application
//!
//! The loader works in two steps. `plan` is pure apart from the one
//! surrogate-key block reservation: it classifies every extracted natural
//! key against the dimension's current rows and produces a
//! [`DimensionLoadPlan`]. `apply` writes the plan through the sink, with
//! expire + insert in the same transaction.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::DimensionRow;

mod loader;

pub use loader::{apply_plan, plan_dimension_load, DimensionLoadOutcome};

/// Expire one current row: `is_current = false`, `valid_to = batch date`,
/// written in the same transaction as any successor insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expiration {
    pub surrogate_key: i64,
    pub valid_to: NaiveDate,
}

/// Everything one dimension load will write, computed before any write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionLoadPlan {
    /// Logical dimension name
    pub dimension: String,
    /// Current rows to expire (Type 2 changes and retirements)
    pub expirations: Vec<Expiration>,
    /// New rows: first versions and Type 2 successors
    pub inserts: Vec<DimensionRow>,
    /// Type 1 in-place overwrites, keeping the existing surrogate key
    pub upserts: Vec<DimensionRow>,
    /// Natural keys whose tracked attributes were unchanged
    pub unchanged: u64,
    /// Rows excluded by mandatory-field checks
    pub rejected: u64,
}

impl DimensionLoadPlan {
    pub fn is_empty(&self) -> bool {
        self.expirations.is_empty() && self.inserts.is_empty() && self.upserts.is_empty()
    }

    /// Counts for the audit record: {inserted, versioned, unchanged}
    pub fn inserted(&self) -> u64 {
        self.inserts
            .iter()
            .filter(|r| r.version_number == 1)
            .count() as u64
    }

    pub fn versioned(&self) -> u64 {
        self.inserts
            .iter()
            .filter(|r| r.version_number > 1)
            .count() as u64
            + self.upserts.len() as u64
    }
}

/// Deterministic hash of the tracked-for-history attribute subset.
///
/// Column order is sorted and values serialize canonically, so the same
/// attributes always produce the same hash regardless of extraction order.
/// An empty tracked list means every attribute participates.
pub fn change_hash(attributes: &BTreeMap<String, Value>, tracked: &[String]) -> String {
    let mut hasher = Sha256::new();

    let mut feed = |column: &str, value: Option<&Value>| {
        hasher.update(column.as_bytes());
        hasher.update([0x1f]);
        match value {
            Some(v) => hasher.update(v.to_string().as_bytes()),
            None => hasher.update([0x00]),
        }
        hasher.update([0x1e]);
    };

    if tracked.is_empty() {
        for (column, value) in attributes {
            feed(column, Some(value));
        }
    } else {
        let mut columns: Vec<&String> = tracked.iter().collect();
        columns.sort();
        for column in columns {
            feed(column, attributes.get(column.as_str()));
        }
    }

    hex::encode(hasher.finalize())
}
