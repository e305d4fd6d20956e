//! Referential integrity: orphan facts and duplicate dimension keys

use std::collections::{HashMap, HashSet};

use serde_json::json;

use crate::config::MappingConfig;
use crate::error::EtlResult;
use crate::model::{ValidationResult, UNKNOWN_KEY};
use crate::sink::Sink;

/// Two families of checks:
/// - per fact foreign key, `orphan_records`: rows whose key is the sentinel
///   unknown key or matches no current row of the referenced dimension;
/// - per dimension, `duplicate_keys`: natural keys with more than one
///   current row. Both must be zero to pass.
pub async fn validate_referential_integrity(
    sink: &dyn Sink,
    mappings: &[MappingConfig],
) -> EtlResult<Vec<ValidationResult>> {
    let mut results = Vec::new();

    // dimension name -> current surrogate keys
    let mut dimension_keys: HashMap<String, HashSet<i64>> = HashMap::new();

    for mapping in mappings {
        let Some(spec) = mapping.dimension_spec() else {
            continue;
        };
        let current = sink.fetch_current_dimension(&mapping.target_table).await?;

        let mut per_natural: HashMap<&str, u64> = HashMap::new();
        for row in &current {
            *per_natural.entry(row.natural_key.as_str()).or_default() += 1;
        }
        let duplicate_keys = per_natural.values().filter(|n| **n > 1).count() as u64;

        let check_name = format!("duplicate_keys:{}", mapping.target_table);
        let details = json!({
            "dimension": spec.dimension,
            "current_rows": current.len(),
            "duplicate_keys": duplicate_keys,
        });
        results.push(if duplicate_keys == 0 {
            ValidationResult::pass(check_name, details)
        } else {
            ValidationResult::fail(check_name, details)
        });

        dimension_keys.insert(
            spec.dimension.clone(),
            current.iter().map(|r| r.surrogate_key).collect(),
        );
    }

    for mapping in mappings {
        let Some(spec) = mapping.fact_spec() else {
            continue;
        };
        let rows = sink.fetch_rows(&mapping.target_table).await?;

        for dim_ref in &spec.dimension_refs {
            let known = dimension_keys.get(&dim_ref.dimension);
            let mut orphan_records = 0u64;

            for row in &rows {
                let key = row.get(&dim_ref.key_column).and_then(|v| v.as_i64());
                let is_orphan = match key {
                    Some(UNKNOWN_KEY) | None => true,
                    Some(k) => known.map(|set| !set.contains(&k)).unwrap_or(true),
                };
                if is_orphan {
                    orphan_records += 1;
                }
            }

            let check_name = format!(
                "referential:{}.{}",
                mapping.target_table, dim_ref.key_column
            );
            let details = json!({
                "dimension": dim_ref.dimension,
                "fact_rows": rows.len(),
                "orphan_records": orphan_records,
            });
            results.push(if orphan_records == 0 {
                ValidationResult::pass(check_name, details)
            } else {
                ValidationResult::fail(check_name, details)
            });
        }
    }

    Ok(results)
}
