//! Declarative data-quality rules: evaluation and load-time row actions

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{RuleAction, RuleKind, RunManifest, Severity, ValidationRule};
use crate::error::{ConfigError, EtlError, EtlResult};
use crate::model::{Record, SourceRow, ValidationResult};
use crate::sink::Sink;

fn is_null_like(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn as_decimal(value: &Value) -> Option<rust_decimal::Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Row-level violation test for the kinds that can be judged on a single
/// row. Unique and Referential are set-level and always pass here.
fn violates_row(rule: &ValidationRule, pattern: Option<&Regex>, record: &Record) -> bool {
    let value = rule.column.as_deref().and_then(|c| record.get(c));
    match &rule.kind {
        RuleKind::NotNull => is_null_like(value),
        RuleKind::Range { min, max } => {
            if is_null_like(value) {
                return false;
            }
            match value.and_then(as_decimal) {
                Some(v) => {
                    min.map(|m| v < m).unwrap_or(false) || max.map(|m| v > m).unwrap_or(false)
                }
                // A range rule over a non-numeric value is a violation
                None => true,
            }
        }
        RuleKind::Pattern { .. } => {
            if is_null_like(value) {
                return false;
            }
            match (value.and_then(Value::as_str), pattern) {
                (Some(s), Some(regex)) => !regex.is_match(s),
                _ => true,
            }
        }
        RuleKind::Custom { expr } => !expr.evaluate(record),
        RuleKind::Unique | RuleKind::Referential { .. } => false,
    }
}

fn compile_pattern(rule: &ValidationRule) -> EtlResult<Option<Regex>> {
    match &rule.kind {
        RuleKind::Pattern { regex } => {
            let compiled = Regex::new(regex).map_err(|e| {
                EtlError::Config(ConfigError::InvalidRule {
                    rule: rule.rule_id.clone(),
                    reason: e.to_string(),
                })
            })?;
            Ok(Some(compiled))
        }
        _ => Ok(None),
    }
}

fn result_for(rule: &ValidationRule, checked: usize, violations: u64) -> ValidationResult {
    let check_name = format!("dq:{}", rule.name);
    let details = json!({
        "rule_id": rule.rule_id,
        "table": rule.table,
        "column": rule.column,
        "severity": rule.severity,
        "rows_checked": checked,
        "violations": violations,
    });

    if violations == 0 {
        ValidationResult::pass(check_name, details)
    } else if rule.severity == Severity::Error {
        ValidationResult::fail(check_name, details)
    } else {
        ValidationResult::warn(check_name, details)
    }
}

/// Evaluate every declared rule against its loaded target table.
///
/// Severity decides whether a violation flips the overall run to FAIL
/// (Error) or is recorded without blocking (Warning/Info).
pub async fn validate_quality_rules(
    sink: &dyn Sink,
    manifest: &RunManifest,
) -> EtlResult<Vec<ValidationResult>> {
    // dimension name -> its target table, for Referential rules
    let dimension_tables: HashMap<&str, &str> = manifest
        .mappings
        .iter()
        .filter_map(|m| {
            m.dimension_spec()
                .map(|spec| (spec.dimension.as_str(), m.target_table.as_str()))
        })
        .collect();

    let mut results = Vec::with_capacity(manifest.rules.len());

    for rule in &manifest.rules {
        let rows = sink.fetch_rows(&rule.table).await?;
        let pattern = compile_pattern(rule)?;

        let violations = match &rule.kind {
            RuleKind::Unique => {
                let Some(column) = rule.column.as_deref() else {
                    continue;
                };
                let mut seen: HashMap<String, u64> = HashMap::new();
                for row in &rows {
                    if let Some(value) = row.get(column) {
                        if !is_null_like(Some(value)) {
                            *seen.entry(value.to_string()).or_default() += 1;
                        }
                    }
                }
                seen.values().filter(|n| **n > 1).map(|n| n - 1).sum()
            }
            RuleKind::Referential { dimension } => {
                let Some(column) = rule.column.as_deref() else {
                    continue;
                };
                let known: HashSet<String> = match dimension_tables.get(dimension.as_str()) {
                    Some(table) => sink
                        .fetch_current_dimension(table)
                        .await?
                        .into_iter()
                        .map(|r| r.natural_key)
                        .collect(),
                    None => HashSet::new(),
                };
                rows.iter()
                    .filter(|row| match row.get(column).and_then(Value::as_str) {
                        Some(key) => !known.contains(key),
                        None => !is_null_like(row.get(column)),
                    })
                    .count() as u64
            }
            _ => rows
                .iter()
                .filter(|row| violates_row(rule, pattern.as_ref(), row))
                .count() as u64,
        };

        debug!(rule = %rule.rule_id, violations, "quality rule evaluated");
        results.push(result_for(rule, rows.len(), violations));
    }

    Ok(results)
}

/// Outcome of applying load-time rule actions to a batch
#[derive(Debug, Clone, Default)]
pub struct RowActionOutcome {
    pub rows: Vec<SourceRow>,
    pub rejected: u64,
    pub fixed: u64,
}

/// Apply Reject/Fix actions before the load.
///
/// Only row-level kinds participate; Unique and Referential are judged
/// post-load over the whole table. Log/Continue actions change nothing
/// here; their violations surface through [`validate_quality_rules`].
pub fn apply_row_actions(
    rules: &[ValidationRule],
    target_table: &str,
    rows: Vec<SourceRow>,
) -> EtlResult<RowActionOutcome> {
    let mut active: Vec<(&ValidationRule, Option<Regex>)> = Vec::new();
    for rule in rules {
        if rule.table != target_table {
            continue;
        }
        if matches!(rule.action, RuleAction::Reject | RuleAction::Fix { .. }) {
            active.push((rule, compile_pattern(rule)?));
        }
    }

    if active.is_empty() {
        return Ok(RowActionOutcome {
            rows,
            ..RowActionOutcome::default()
        });
    }

    let mut outcome = RowActionOutcome::default();
    'rows: for mut row in rows {
        for (rule, pattern) in &active {
            if !violates_row(rule, pattern.as_ref(), row.as_map()) {
                continue;
            }
            match &rule.action {
                RuleAction::Reject => {
                    outcome.rejected += 1;
                    continue 'rows;
                }
                RuleAction::Fix { replacement } => {
                    if let Some(column) = rule.column.as_deref() {
                        row.set(column, replacement.clone());
                        outcome.fixed += 1;
                    }
                }
                RuleAction::Log | RuleAction::Continue => {}
            }
        }
        outcome.rows.push(row);
    }

    Ok(outcome)
}
