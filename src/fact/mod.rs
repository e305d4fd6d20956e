//! Fact-table loading: foreign-key resolution, date keys, measures
//!
//! Every foreign key resolves through a frozen lookup cache or falls back
//! to the sentinel unknown key; resolution never fails a row. Financial
//! measures default to zero rather than propagating NULL, so additive
//! aggregates stay well-defined, while flags remain tri-state. Full reloads
//! are all-or-nothing per table: chunks bound memory and round-trips, and
//! the visible swap commits only after the last chunk succeeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{FactSpec, LoadStrategy, MappingConfig};
use crate::error::EtlResult;
use crate::model::{date_key, FactRow, Record, SourceRow, UNKNOWN_KEY};
use crate::resolver::KeyLookupCache;
use crate::sink::Sink;

/// Result of one fact load
#[derive(Debug, Clone, Default)]
pub struct FactLoadOutcome {
    pub transformed: u64,
    pub rejected: u64,
    /// Final loaded count, reported by the sink and consumed directly by
    /// the row-count validator
    pub loaded: u64,
}

/// Transform extracted rows into fully-resolved fact rows.
///
/// Rows failing mandatory-field checks are excluded and counted; a measure
/// column carrying a non-numeric value also rejects its row rather than
/// loading a corrupt aggregate.
pub fn transform_fact_rows(
    mapping: &MappingConfig,
    spec: &FactSpec,
    source_rows: &[SourceRow],
    caches: &HashMap<String, Arc<KeyLookupCache>>,
) -> (Vec<FactRow>, u64) {
    let mut facts = Vec::with_capacity(source_rows.len());
    let mut rejected = 0u64;

    'rows: for row in source_rows {
        if mapping
            .mandatory_columns
            .iter()
            .any(|column| row.is_missing(column))
        {
            rejected += 1;
            continue;
        }

        let mut fact = FactRow::default();

        for dim_ref in &spec.dimension_refs {
            let key = match row.get_str(&dim_ref.source) {
                Some(natural_key) => match caches.get(&dim_ref.dimension) {
                    Some(cache) => cache.resolve(natural_key),
                    None => UNKNOWN_KEY,
                },
                // Missing natural key resolves to the sentinel; the
                // referential-integrity validator counts it as an orphan
                None => UNKNOWN_KEY,
            };
            fact.dimension_keys.insert(dim_ref.key_column.clone(), key);
        }

        for role in &spec.date_roles {
            fact.date_keys
                .insert(role.key_column.clone(), date_key(row.get_date(&role.source)));
        }

        for id in &spec.degenerate_ids {
            let value = match row.get(&id.source) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            fact.degenerate_ids.insert(id.target.clone(), value);
        }

        for measure in &spec.measures {
            let value = if row.is_missing(&measure.source) {
                Decimal::ZERO
            } else {
                match row.get_decimal(&measure.source) {
                    Some(d) => d,
                    None => {
                        warn!(
                            mapping = %mapping.mapping_id,
                            column = %measure.source,
                            "non-numeric measure value, rejecting row"
                        );
                        rejected += 1;
                        continue 'rows;
                    }
                }
            };
            fact.measures.insert(measure.target.clone(), value);
        }

        for flag in &spec.flags {
            fact.flags.insert(flag.target.clone(), row.get_bool(&flag.source));
        }

        facts.push(fact);
    }

    (facts, rejected)
}

/// Flatten a fact row to the sink's generic record shape
pub fn fact_record(fact: &FactRow) -> Record {
    let mut record: Record = BTreeMap::new();
    for (column, key) in &fact.dimension_keys {
        record.insert(column.clone(), Value::Number((*key).into()));
    }
    for (column, key) in &fact.date_keys {
        record.insert(column.clone(), Value::Number((*key).into()));
    }
    for (column, id) in &fact.degenerate_ids {
        record.insert(column.clone(), Value::String(id.clone()));
    }
    for (column, measure) in &fact.measures {
        record.insert(
            column.clone(),
            serde_json::to_value(measure).unwrap_or(Value::Null),
        );
    }
    for (column, flag) in &fact.flags {
        record.insert(
            column.clone(),
            match flag {
                Some(b) => Value::Bool(*b),
                None => Value::Null,
            },
        );
    }
    record
}

/// Transform and load one fact mapping through the sink
pub async fn load_fact(
    mapping: &MappingConfig,
    spec: &FactSpec,
    source_rows: &[SourceRow],
    caches: &HashMap<String, Arc<KeyLookupCache>>,
    sink: &dyn Sink,
) -> EtlResult<FactLoadOutcome> {
    let (facts, rejected) = transform_fact_rows(mapping, spec, source_rows, caches);
    let records: Vec<Record> = facts.iter().map(fact_record).collect();
    let transformed = records.len() as u64;

    let loaded = match mapping.load_strategy {
        LoadStrategy::Full => {
            sink.swap_load(&mapping.target_table, records, mapping.chunk_size)
                .await?
        }
        LoadStrategy::Incremental => {
            let mut total = 0u64;
            for chunk in records.chunks(mapping.chunk_size.max(1)) {
                total += sink.bulk_load(&mapping.target_table, chunk.to_vec()).await?;
            }
            total
        }
    };

    debug!(
        mapping = %mapping.mapping_id,
        transformed,
        rejected,
        loaded,
        "fact load complete"
    );

    Ok(FactLoadOutcome {
        transformed,
        rejected,
        loaded,
    })
}
