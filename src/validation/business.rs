//! Cross-row business invariants over the loaded warehouse

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::RunManifest;
use crate::error::EtlResult;
use crate::model::{ValidationResult, NULL_DATE_KEY};
use crate::sink::Sink;

/// Three invariant families:
/// - every dimension row with `is_current = true` has `valid_to = NULL`
///   (the pairing every writer must maintain; verified here on every run
///   rather than trusted at call sites);
/// - version numbers per natural key are gap-free from 1;
/// - every fact date key falls inside the populated calendar range, with
///   the null-date key 0 always allowed.
pub async fn validate_business_rules(
    sink: &dyn Sink,
    manifest: &RunManifest,
) -> EtlResult<Vec<ValidationResult>> {
    let mut results = Vec::new();

    for mapping in &manifest.mappings {
        if mapping.dimension_spec().is_none() {
            continue;
        }
        let history = sink.fetch_dimension_history(&mapping.target_table).await?;

        let current_with_end = history
            .iter()
            .filter(|r| r.is_current && r.valid_to.is_some())
            .count() as u64;
        let check_name = format!("current_flag_pairing:{}", mapping.target_table);
        let details = json!({
            "rows": history.len(),
            "violations": current_with_end,
        });
        results.push(if current_with_end == 0 {
            ValidationResult::pass(check_name, details)
        } else {
            ValidationResult::fail(check_name, details)
        });

        let mut versions: HashMap<&str, Vec<i32>> = HashMap::new();
        for row in &history {
            versions
                .entry(row.natural_key.as_str())
                .or_default()
                .push(row.version_number);
        }
        let mut gapped_keys = 0u64;
        for numbers in versions.values_mut() {
            numbers.sort_unstable();
            let gap_free = numbers
                .iter()
                .enumerate()
                .all(|(i, v)| *v == i as i32 + 1);
            if !gap_free {
                gapped_keys += 1;
            }
        }
        let check_name = format!("version_sequence:{}", mapping.target_table);
        let details = json!({
            "natural_keys": versions.len(),
            "gapped_keys": gapped_keys,
        });
        results.push(if gapped_keys == 0 {
            ValidationResult::pass(check_name, details)
        } else {
            ValidationResult::fail(check_name, details)
        });
    }

    if let Some(range) = manifest.settings.calendar_range {
        for mapping in &manifest.mappings {
            let Some(spec) = mapping.fact_spec() else {
                continue;
            };
            if spec.date_roles.is_empty() {
                continue;
            }
            let rows = sink.fetch_rows(&mapping.target_table).await?;

            for role in &spec.date_roles {
                let out_of_range = rows
                    .iter()
                    .filter_map(|row| row.get(&role.key_column).and_then(Value::as_i64))
                    .filter(|key| {
                        let key = *key as i32;
                        key != NULL_DATE_KEY && (key < range.min || key > range.max)
                    })
                    .count() as u64;

                let check_name = format!(
                    "calendar_range:{}.{}",
                    mapping.target_table, role.key_column
                );
                let details = json!({
                    "min": range.min,
                    "max": range.max,
                    "out_of_range": out_of_range,
                });
                results.push(if out_of_range == 0 {
                    ValidationResult::pass(check_name, details)
                } else {
                    ValidationResult::fail(check_name, details)
                });
            }
        }
    }

    Ok(results)
}
