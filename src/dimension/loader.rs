//! The dimension load algorithm

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{DimensionSpec, MappingConfig, ScdKind};
use crate::error::EtlResult;
use crate::model::{DimensionRow, SourceRow};
use crate::sequence::KeySequenceService;
use crate::sink::Sink;

use super::{change_hash, DimensionLoadPlan, Expiration};

/// Plan result plus the sink-reported state needed by validation
#[derive(Debug, Clone)]
pub struct DimensionLoadOutcome {
    pub plan: DimensionLoadPlan,
    /// Rows written (inserts + upserts)
    pub loaded: u64,
}

/// Classify extracted rows against the dimension's current rows and produce
/// the load plan. Surrogate keys for all inserts come from one block
/// reservation.
///
/// Type 2: unseen key inserts version 1; changed tracked hash expires the
/// current row and inserts the successor; unchanged hash is a no-op, which
/// is what makes re-runs idempotent. Keys present in the dimension but
/// absent from the source stay untouched unless `retire_missing` is set.
///
/// Type 1 upserts in place by natural key: no history rows, no version
/// counter.
pub async fn plan_dimension_load(
    mapping: &MappingConfig,
    spec: &DimensionSpec,
    source_rows: &[SourceRow],
    current_rows: &[DimensionRow],
    batch_date: NaiveDate,
    sequence: &dyn KeySequenceService,
) -> EtlResult<DimensionLoadPlan> {
    let mut plan = DimensionLoadPlan {
        dimension: spec.dimension.clone(),
        ..DimensionLoadPlan::default()
    };

    // Natural key arrives through its column mapping when one is declared,
    // otherwise under its own name.
    let natural_key_source = mapping
        .columns
        .iter()
        .find(|c| c.target == spec.natural_key)
        .map(|c| c.source.as_str())
        .unwrap_or(spec.natural_key.as_str());

    // Extract and transform, mandatory-field checks first. Within-batch
    // duplicates collapse last-wins.
    let mut incoming: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for row in source_rows {
        if mapping
            .mandatory_columns
            .iter()
            .any(|column| row.is_missing(column))
        {
            plan.rejected += 1;
            continue;
        }
        let Some(natural_key) = row.get_str(natural_key_source).map(str::to_string) else {
            plan.rejected += 1;
            continue;
        };

        let mut attributes: BTreeMap<String, Value> = BTreeMap::new();
        attributes.insert(
            spec.natural_key.clone(),
            Value::String(natural_key.clone()),
        );
        for column in &mapping.columns {
            if column.target == spec.natural_key {
                continue;
            }
            attributes.insert(
                column.target.clone(),
                column.transform.apply(row.get(&column.source)),
            );
        }

        if incoming.insert(natural_key.clone(), attributes).is_some() {
            warn!(
                dimension = %spec.dimension,
                natural_key = %natural_key,
                "duplicate natural key in batch, keeping last occurrence"
            );
        }
    }

    let current_by_key: HashMap<&str, &DimensionRow> = current_rows
        .iter()
        .filter(|r| r.is_current)
        .map(|r| (r.natural_key.as_str(), r))
        .collect();

    // Classify before reserving so the block is exactly as large as needed
    enum Pending<'a> {
        Insert(String, BTreeMap<String, Value>),
        Version(&'a DimensionRow, BTreeMap<String, Value>),
    }

    let mut pending: Vec<Pending<'_>> = Vec::new();
    for (natural_key, attributes) in incoming.iter() {
        match current_by_key.get(natural_key.as_str()) {
            None => pending.push(Pending::Insert(natural_key.clone(), attributes.clone())),
            Some(&current) => {
                let before = change_hash(&current.attributes, &spec.tracked_columns);
                let after = change_hash(attributes, &spec.tracked_columns);
                if before == after {
                    plan.unchanged += 1;
                } else if spec.scd == ScdKind::Type2 {
                    pending.push(Pending::Version(current, attributes.clone()));
                } else {
                    // Type 1 keeps the surrogate key and overwrites in place
                    plan.upserts.push(DimensionRow {
                        natural_key: natural_key.clone(),
                        surrogate_key: current.surrogate_key,
                        attributes: attributes.clone(),
                        version_number: 1,
                        valid_from: current.valid_from,
                        valid_to: None,
                        is_current: true,
                    });
                }
            }
        }
    }

    let new_keys = pending.len() as u32;

    let mut next_key = if new_keys > 0 {
        sequence.reserve(&spec.dimension, new_keys).await?
    } else {
        0
    };

    for item in pending {
        match item {
            Pending::Insert(natural_key, attributes) => {
                plan.inserts.push(DimensionRow::initial(
                    natural_key,
                    next_key,
                    attributes,
                    batch_date,
                ));
                next_key += 1;
            }
            Pending::Version(current, attributes) => {
                plan.expirations.push(Expiration {
                    surrogate_key: current.surrogate_key,
                    valid_to: batch_date,
                });
                plan.inserts
                    .push(current.successor(next_key, attributes, batch_date));
                next_key += 1;
            }
        }
    }

    if spec.retire_missing {
        for (key, current) in &current_by_key {
            if !incoming.contains_key(*key) {
                plan.expirations.push(Expiration {
                    surrogate_key: current.surrogate_key,
                    valid_to: batch_date,
                });
            }
        }
    }

    debug!(
        dimension = %spec.dimension,
        inserted = plan.inserted(),
        versioned = plan.versioned(),
        unchanged = plan.unchanged,
        rejected = plan.rejected,
        "dimension load planned"
    );

    Ok(plan)
}

/// Write the plan through the sink. Expirations and inserts land in the
/// same transaction; a no-op plan performs no write at all.
pub async fn apply_plan(
    sink: &dyn Sink,
    target_table: &str,
    plan: &DimensionLoadPlan,
) -> EtlResult<DimensionLoadOutcome> {
    let loaded = (plan.inserts.len() + plan.upserts.len()) as u64;
    if !plan.is_empty() {
        sink.apply_dimension_plan(target_table, plan).await?;
    }

    Ok(DimensionLoadOutcome {
        plan: plan.clone(),
        loaded,
    })
}
