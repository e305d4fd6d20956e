//! Key resolver: per-dimension natural-key -> surrogate-key lookup caches
//!
//! A cache is built once per dimension per run, after every dimension load
//! has completed (the orchestrator's phase barrier), and is read-only for
//! all fact tasks in that run. A miss resolves to the sentinel unknown key
//! and is recorded, never raised: a handful of unresolved foreign keys must
//! not abort a multi-million-row fact load. Misses surface through the
//! referential-integrity validator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::model::{DimensionRow, UNKNOWN_KEY};

/// Immutable snapshot of one dimension's current rows
pub struct KeyLookupCache {
    dimension: String,
    keys: HashMap<String, i64>,
    misses: AtomicU64,
}

impl KeyLookupCache {
    /// Build from the dimension's current rows. Non-current rows are
    /// ignored; a fact must never reference an expired version.
    pub fn build(dimension: impl Into<String>, rows: &[DimensionRow]) -> Self {
        let dimension = dimension.into();
        let keys: HashMap<String, i64> = rows
            .iter()
            .filter(|r| r.is_current)
            .map(|r| (r.natural_key.clone(), r.surrogate_key))
            .collect();

        debug!(dimension = %dimension, entries = keys.len(), "lookup cache built");
        Self {
            dimension,
            keys,
            misses: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Resolve a natural key. Returns [`UNKNOWN_KEY`] on miss and counts it.
    pub fn resolve(&self, natural_key: &str) -> i64 {
        match self.keys.get(natural_key) {
            Some(key) => *key,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                UNKNOWN_KEY
            }
        }
    }

    /// Number of lookups that fell through to the sentinel key
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Surrogate keys present in the snapshot, for referential checks
    pub fn contains_surrogate(&self, surrogate_key: i64) -> bool {
        self.keys.values().any(|k| *k == surrogate_key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn row(natural_key: &str, surrogate_key: i64, is_current: bool) -> DimensionRow {
        DimensionRow {
            natural_key: natural_key.to_string(),
            surrogate_key,
            attributes: BTreeMap::new(),
            version_number: 1,
            valid_from: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            valid_to: None,
            is_current,
        }
    }

    #[test]
    fn test_resolve_hits_and_misses() {
        let cache = KeyLookupCache::build("party", &[row("P-1", 10, true)]);

        assert_eq!(cache.resolve("P-1"), 10);
        assert_eq!(cache.resolve("P-404"), UNKNOWN_KEY);
        assert_eq!(cache.resolve("P-405"), UNKNOWN_KEY);
        assert_eq!(cache.miss_count(), 2);
    }

    #[test]
    fn test_expired_versions_excluded() {
        let cache = KeyLookupCache::build(
            "party",
            &[row("P-1", 10, false), row("P-1", 11, true)],
        );

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve("P-1"), 11);
        assert!(cache.contains_surrogate(11));
        assert!(!cache.contains_surrogate(10));
    }
}
