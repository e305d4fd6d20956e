//! Run configuration: mapping metadata, transforms, and validation rules
//!
//! Mappings and rules are static for a run. They are loaded once, either
//! from the metadata store (`database` feature) or from a YAML run manifest,
//! then validated for structural soundness before the orchestrator starts.
//!
//! Transformation kinds are a closed tagged variant evaluated by an internal
//! dispatch, never runtime code execution, so the engine stays auditable.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};

/// How a dimension absorbs attribute changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScdKind {
    /// Overwrite in place, no history
    Type1,
    /// Versioned history with expire + insert
    Type2,
}

/// FULL truncates and reloads the target; INCREMENTAL appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStrategy {
    Full,
    Incremental,
}

/// Closed set of column transformations.
///
/// Scalar kinds are applied by the dimension loader; `Lookup` and `DateKey`
/// are markers interpreted by the fact loader through its dimension refs and
/// date roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformKind {
    Direct,
    Constant { value: Value },
    Uppercase,
    Lowercase,
    Trim,
    Coalesce { default: Value },
    Lookup { dimension: String },
    DateKey { role: String },
}

impl TransformKind {
    /// Apply a scalar transform to an extracted value. `Lookup`/`DateKey`
    /// pass through untouched here.
    pub fn apply(&self, value: Option<&Value>) -> Value {
        match self {
            TransformKind::Direct | TransformKind::Lookup { .. } | TransformKind::DateKey { .. } => {
                value.cloned().unwrap_or(Value::Null)
            }
            TransformKind::Constant { value } => value.clone(),
            TransformKind::Uppercase => match value {
                Some(Value::String(s)) => Value::String(s.to_uppercase()),
                other => other.cloned().unwrap_or(Value::Null),
            },
            TransformKind::Lowercase => match value {
                Some(Value::String(s)) => Value::String(s.to_lowercase()),
                other => other.cloned().unwrap_or(Value::Null),
            },
            TransformKind::Trim => match value {
                Some(Value::String(s)) => Value::String(s.trim().to_string()),
                other => other.cloned().unwrap_or(Value::Null),
            },
            TransformKind::Coalesce { default } => match value {
                None | Some(Value::Null) => default.clone(),
                Some(v) => v.clone(),
            },
        }
    }
}

fn default_transform() -> TransformKind {
    TransformKind::Direct
}

/// One source column -> target column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
    #[serde(default = "default_transform")]
    pub transform: TransformKind,
}

/// Dimension-side target description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Logical dimension name referenced by fact mappings
    pub dimension: String,
    /// Target column holding the natural key
    pub natural_key: String,
    pub scd: ScdKind,
    /// Target columns whose changes open a new version (audit columns
    /// excluded). Empty means every mapped column is tracked.
    #[serde(default)]
    pub tracked_columns: Vec<String>,
    /// Expire current rows whose natural key is absent from the source
    #[serde(default)]
    pub retire_missing: bool,
}

/// One foreign-key reference from a fact to a dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRef {
    /// Logical dimension name (must match a `DimensionSpec::dimension`)
    pub dimension: String,
    /// Source column carrying the natural key
    pub source: String,
    /// Target column receiving the surrogate key
    pub key_column: String,
}

/// One role-played date on a fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRole {
    pub role: String,
    /// Source column carrying an ISO date
    pub source: String,
    /// Target column receiving the YYYYMMDD key
    pub key_column: String,
}

/// Simple source -> target passthrough used for degenerate ids, measures
/// and flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub source: String,
    pub target: String,
}

/// Fact-side target description
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FactSpec {
    #[serde(default)]
    pub dimension_refs: Vec<DimensionRef>,
    #[serde(default)]
    pub date_roles: Vec<DateRole>,
    #[serde(default)]
    pub degenerate_ids: Vec<FieldSpec>,
    #[serde(default)]
    pub measures: Vec<FieldSpec>,
    #[serde(default)]
    pub flags: Vec<FieldSpec>,
}

/// What the mapping writes into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    Dimension(DimensionSpec),
    Fact(FactSpec),
}

fn default_ratio() -> f64 {
    1.0
}

fn default_chunk_size() -> usize {
    1_000
}

/// Declarative description of one extract-transform-load unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub mapping_id: String,
    pub source_table: String,
    pub target_table: String,
    pub target: TargetKind,
    /// Attribute-level column mappings (dimension attributes)
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
    /// Source columns that must be present and non-empty; rows failing this
    /// are rejected at extract time, never silently loaded
    #[serde(default)]
    pub mandatory_columns: Vec<String>,
    pub load_strategy: LoadStrategy,
    #[serde(default = "default_ratio")]
    pub expected_ratio: f64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub load_priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-mapping extract/load timeout; expiry surfaces as a connection
    /// error
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl MappingConfig {
    pub fn is_dimension(&self) -> bool {
        matches!(self.target, TargetKind::Dimension(_))
    }

    pub fn dimension_spec(&self) -> Option<&DimensionSpec> {
        match &self.target {
            TargetKind::Dimension(spec) => Some(spec),
            TargetKind::Fact(_) => None,
        }
    }

    pub fn fact_spec(&self) -> Option<&FactSpec> {
        match &self.target {
            TargetKind::Fact(spec) => Some(spec),
            TargetKind::Dimension(_) => None,
        }
    }
}

/// Severity of a validation rule violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Row fate when a rule fires at load time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Exclude the row from the load and count it as rejected
    Reject,
    /// Record only
    Log,
    /// Substitute the declared replacement value
    Fix { replacement: Value },
    /// Record and keep going
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Closed boolean expression over a row, evaluated by an internal
/// interpreter. This is the CUSTOM rule body; it is data, not code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum RuleExpr {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        column: String,
    },
    Not {
        inner: Box<RuleExpr>,
    },
    All {
        exprs: Vec<RuleExpr>,
    },
    Any {
        exprs: Vec<RuleExpr>,
    },
}

impl RuleExpr {
    /// Evaluate against a row. A comparison over a missing or
    /// incomparable value is false, never an error.
    pub fn evaluate(&self, row: &BTreeMap<String, Value>) -> bool {
        match self {
            RuleExpr::Compare { column, op, value } => match row.get(column) {
                Some(actual) => compare_values(actual, *op, value),
                None => false,
            },
            RuleExpr::IsNull { column } => {
                matches!(row.get(column), None | Some(Value::Null))
            }
            RuleExpr::Not { inner } => !inner.evaluate(row),
            RuleExpr::All { exprs } => exprs.iter().all(|e| e.evaluate(row)),
            RuleExpr::Any { exprs } => exprs.iter().any(|e| e.evaluate(row)),
        }
    }
}

fn compare_values(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    // Numeric comparison goes through Decimal so 1 and 1.0 compare equal
    let ordering = match (as_decimal(actual), as_decimal(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => {
                if matches!(op, CompareOp::Eq | CompareOp::Ne) {
                    return if op == CompareOp::Eq {
                        actual == expected
                    } else {
                        actual != expected
                    };
                }
                None
            }
        },
    };

    match (ordering, op) {
        (Some(ord), CompareOp::Eq) => ord.is_eq(),
        (Some(ord), CompareOp::Ne) => !ord.is_eq(),
        (Some(ord), CompareOp::Lt) => ord.is_lt(),
        (Some(ord), CompareOp::Le) => ord.is_le(),
        (Some(ord), CompareOp::Gt) => ord.is_gt(),
        (Some(ord), CompareOp::Ge) => ord.is_ge(),
        (None, _) => false,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// What a validation rule checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    NotNull,
    Unique,
    Range {
        min: Option<Decimal>,
        max: Option<Decimal>,
    },
    Pattern {
        regex: String,
    },
    Referential {
        dimension: String,
    },
    Custom {
        /// Expression that must hold for the row to pass
        expr: RuleExpr,
    },
}

/// One declarative data-quality rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub rule_id: String,
    pub name: String,
    /// Target table the rule applies to
    pub table: String,
    /// Column under check; unused for Custom rules
    #[serde(default)]
    pub column: Option<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub severity: Severity,
    pub action: RuleAction,
}

/// Calendar bounds for date-key validation, as YYYYMMDD keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRange {
    pub min: i32,
    pub max: i32,
}

fn default_workers() -> usize {
    4
}

fn default_stop_on_error() -> bool {
    true
}

/// Run-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Effective date of the batch; every extract is deterministic for it
    pub as_of: NaiveDate,
    #[serde(default = "default_workers")]
    pub max_parallel_workers: usize,
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
    #[serde(default)]
    pub calendar_range: Option<CalendarRange>,
}

/// The full static configuration of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub settings: RunSettings,
    pub mappings: Vec<MappingConfig>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

impl RunManifest {
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let manifest: RunManifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Manifest {
            message: e.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    /// Structural soundness: unique mapping ids, known dependency edges,
    /// every fact dimension ref matches a declared dimension mapping.
    /// Cycle detection is the orchestrator's job.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut ids = HashSet::new();
        for mapping in &self.mappings {
            if !ids.insert(mapping.mapping_id.as_str()) {
                return Err(ConfigError::DuplicateMapping {
                    mapping: mapping.mapping_id.clone(),
                });
            }
        }

        let dimensions: HashSet<&str> = self
            .mappings
            .iter()
            .filter_map(|m| m.dimension_spec())
            .map(|spec| spec.dimension.as_str())
            .collect();

        for mapping in &self.mappings {
            for dep in &mapping.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        mapping: mapping.mapping_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if let Some(spec) = mapping.fact_spec() {
                for dim_ref in &spec.dimension_refs {
                    if !dimensions.contains(dim_ref.dimension.as_str()) {
                        return Err(ConfigError::UnknownDimension {
                            mapping: mapping.mapping_id.clone(),
                            dimension: dim_ref.dimension.clone(),
                        });
                    }
                }
            }
        }

        for rule in &self.rules {
            if let RuleKind::Pattern { regex } = &rule.kind {
                regex::Regex::new(regex).map_err(|e| ConfigError::InvalidRule {
                    rule: rule.rule_id.clone(),
                    reason: e.to_string(),
                })?;
            }
            let needs_column = !matches!(rule.kind, RuleKind::Custom { .. });
            if needs_column && rule.column.is_none() {
                return Err(ConfigError::InvalidRule {
                    rule: rule.rule_id.clone(),
                    reason: "rule type requires a column".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn mapping(&self, mapping_id: &str) -> Option<&MappingConfig> {
        self.mappings.iter().find(|m| m.mapping_id == mapping_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn country_dimension() -> MappingConfig {
        MappingConfig {
            mapping_id: "map_dim_country".to_string(),
            source_table: "l2_country".to_string(),
            target_table: "dim_country".to_string(),
            target: TargetKind::Dimension(DimensionSpec {
                dimension: "country".to_string(),
                natural_key: "country_code".to_string(),
                scd: ScdKind::Type2,
                tracked_columns: vec!["currency_code".to_string()],
                retire_missing: false,
            }),
            columns: vec![ColumnMapping {
                source: "currency".to_string(),
                target: "currency_code".to_string(),
                transform: TransformKind::Uppercase,
            }],
            mandatory_columns: vec!["country_code".to_string()],
            load_strategy: LoadStrategy::Full,
            expected_ratio: 1.0,
            chunk_size: 1_000,
            load_priority: 0,
            depends_on: vec![],
            timeout_secs: None,
        }
    }

    #[test]
    fn test_transform_apply() {
        assert_eq!(
            TransformKind::Uppercase.apply(Some(&json!("mlt"))),
            json!("MLT")
        );
        assert_eq!(
            TransformKind::Trim.apply(Some(&json!("  EUR "))),
            json!("EUR")
        );
        assert_eq!(
            TransformKind::Coalesce {
                default: json!("XX")
            }
            .apply(None),
            json!("XX")
        );
        assert_eq!(TransformKind::Direct.apply(None), Value::Null);
        assert_eq!(
            TransformKind::Constant { value: json!(7) }.apply(Some(&json!("ignored"))),
            json!(7)
        );
    }

    #[test]
    fn test_rule_expr_evaluation() {
        let mut row = BTreeMap::new();
        row.insert("amount".to_string(), json!(250.0));
        row.insert("status".to_string(), json!("FILED"));

        let expr = RuleExpr::All {
            exprs: vec![
                RuleExpr::Compare {
                    column: "amount".to_string(),
                    op: CompareOp::Gt,
                    value: json!(0),
                },
                RuleExpr::Compare {
                    column: "status".to_string(),
                    op: CompareOp::Eq,
                    value: json!("FILED"),
                },
            ],
        };
        assert!(expr.evaluate(&row));

        let negated = RuleExpr::Not {
            inner: Box::new(expr),
        };
        assert!(!negated.evaluate(&row));

        // Missing column compares false, never errors
        let missing = RuleExpr::Compare {
            column: "absent".to_string(),
            op: CompareOp::Ge,
            value: json!(1),
        };
        assert!(!missing.evaluate(&row));
    }

    #[test]
    fn test_numeric_comparison_crosses_representations() {
        let mut row = BTreeMap::new();
        row.insert("rate".to_string(), json!(1));

        let expr = RuleExpr::Compare {
            column: "rate".to_string(),
            op: CompareOp::Eq,
            value: json!(1.0),
        };
        assert!(expr.evaluate(&row));
    }

    #[test]
    fn test_manifest_rejects_unknown_dependency() {
        let mut mapping = country_dimension();
        mapping.depends_on = vec!["map_missing".to_string()];
        let manifest = RunManifest {
            settings: RunSettings {
                as_of: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                max_parallel_workers: 4,
                stop_on_error: true,
                calendar_range: None,
            },
            mappings: vec![mapping],
            rules: vec![],
        };

        assert!(matches!(
            manifest.validate(),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_manifest_rejects_unmapped_fact_dimension() {
        let fact = MappingConfig {
            mapping_id: "map_fact_filing".to_string(),
            source_table: "l2_filing".to_string(),
            target_table: "fact_filing".to_string(),
            target: TargetKind::Fact(FactSpec {
                dimension_refs: vec![DimensionRef {
                    dimension: "party".to_string(),
                    source: "party_id".to_string(),
                    key_column: "party_key".to_string(),
                }],
                ..FactSpec::default()
            }),
            columns: vec![],
            mandatory_columns: vec![],
            load_strategy: LoadStrategy::Full,
            expected_ratio: 1.0,
            chunk_size: 1_000,
            load_priority: 0,
            depends_on: vec![],
            timeout_secs: None,
        };

        let manifest = RunManifest {
            settings: RunSettings {
                as_of: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                max_parallel_workers: 4,
                stop_on_error: true,
                calendar_range: None,
            },
            mappings: vec![fact],
            rules: vec![],
        };

        assert!(matches!(
            manifest.validate(),
            Err(ConfigError::UnknownDimension { .. })
        ));
    }

    #[test]
    fn test_manifest_yaml_round_trip() {
        let manifest = RunManifest {
            settings: RunSettings {
                as_of: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                max_parallel_workers: 2,
                stop_on_error: false,
                calendar_range: Some(CalendarRange {
                    min: 20200101,
                    max: 20301231,
                }),
            },
            mappings: vec![country_dimension()],
            rules: vec![ValidationRule {
                rule_id: "dq_001".to_string(),
                name: "country code present".to_string(),
                table: "dim_country".to_string(),
                column: Some("country_code".to_string()),
                kind: RuleKind::NotNull,
                severity: Severity::Error,
                action: RuleAction::Reject,
            }],
        };

        let yaml = serde_yaml::to_string(&manifest).expect("serialize");
        let parsed = RunManifest::from_yaml(&yaml).expect("parse");
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_invalid_pattern_rule_rejected() {
        let manifest = RunManifest {
            settings: RunSettings {
                as_of: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                max_parallel_workers: 4,
                stop_on_error: true,
                calendar_range: None,
            },
            mappings: vec![],
            rules: vec![ValidationRule {
                rule_id: "dq_bad".to_string(),
                name: "broken regex".to_string(),
                table: "dim_country".to_string(),
                column: Some("country_code".to_string()),
                kind: RuleKind::Pattern {
                    regex: "[unclosed".to_string(),
                },
                severity: Severity::Error,
                action: RuleAction::Log,
            }],
        };

        assert!(matches!(
            manifest.validate(),
            Err(ConfigError::InvalidRule { .. })
        ));
    }
}
