//! Metadata store: run configuration read from the control schema
//!
//! The engine consumes six read-only tables (`source_systems`,
//! `table_mappings`, `column_mappings`, `lookup_mappings`,
//! `data_quality_rules`, `table_dependencies`) and assembles the same
//! `RunManifest` the YAML manifest provides. Structured parameters are
//! stored as JSONB and deserialized into the closed config variants.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::{
    ColumnMapping, DimensionRef, DimensionSpec, FactSpec, LoadStrategy, MappingConfig, RuleAction,
    RuleKind, RunManifest, RunSettings, Severity, TargetKind, TransformKind, ValidationRule,
};
use crate::error::{ConfigError, ConnectionError, EtlError, EtlResult};

/// Database connection configuration, environment-driven
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/taxdw".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

impl DatabaseConfig {
    pub async fn connect(&self) -> EtlResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connection_timeout)
            .connect(&self.database_url)
            .await
            .map_err(|e| {
                EtlError::Connection(ConnectionError::TargetUnavailable {
                    target_table: "metadata store".to_string(),
                    message: e.to_string(),
                })
            })?;
        info!(max_connections = self.max_connections, "metadata pool connected");
        Ok(pool)
    }
}

/// One registered source system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSystem {
    pub system_code: String,
    pub system_name: String,
    pub connection_env: String,
}

fn metadata_error(message: impl Into<String>) -> EtlError {
    EtlError::Config(ConfigError::Manifest {
        message: message.into(),
    })
}

fn parse_load_strategy(raw: &str) -> EtlResult<LoadStrategy> {
    match raw {
        "FULL" => Ok(LoadStrategy::Full),
        "INCREMENTAL" => Ok(LoadStrategy::Incremental),
        other => Err(metadata_error(format!("unknown load strategy '{other}'"))),
    }
}

fn parse_severity(raw: &str) -> EtlResult<Severity> {
    match raw {
        "ERROR" => Ok(Severity::Error),
        "WARNING" => Ok(Severity::Warning),
        "INFO" => Ok(Severity::Info),
        other => Err(metadata_error(format!("unknown severity '{other}'"))),
    }
}

/// Read-only repository over the control schema
pub struct MetadataRepository {
    pool: PgPool,
}

impl MetadataRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch_source_systems(&self) -> EtlResult<Vec<SourceSystem>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT system_code, system_name, connection_env
            FROM source_systems
            WHERE is_active = true
            ORDER BY system_code
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(system_code, system_name, connection_env)| SourceSystem {
                system_code,
                system_name,
                connection_env,
            })
            .collect())
    }

    /// Assemble the full run manifest from the control schema
    pub async fn load_manifest(&self, settings: RunSettings) -> EtlResult<RunManifest> {
        let mut mappings = self.fetch_mappings().await?;
        let columns = self.fetch_column_mappings().await?;
        let lookups = self.fetch_lookup_mappings().await?;
        let dependencies = self.fetch_dependencies().await?;

        for mapping in &mut mappings {
            if let Some(cols) = columns.get(&mapping.mapping_id) {
                mapping.columns = cols.iter().map(|(c, _)| c.clone()).collect();
                mapping.mandatory_columns = cols
                    .iter()
                    .filter(|(_, mandatory)| *mandatory)
                    .map(|(c, _)| c.source.clone())
                    .collect();
            }
            if let Some(deps) = dependencies.get(&mapping.mapping_id) {
                mapping.depends_on = deps.clone();
            }
            if let TargetKind::Fact(spec) = &mut mapping.target {
                if let Some(refs) = lookups.get(&mapping.mapping_id) {
                    spec.dimension_refs = refs.clone();
                }
            }
        }

        let manifest = RunManifest {
            settings,
            mappings,
            rules: self.fetch_rules().await?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    async fn fetch_mappings(&self) -> EtlResult<Vec<MappingConfig>> {
        type MappingRow = (
            String,
            String,
            String,
            String,
            Value,
            String,
            f64,
            i32,
            i32,
            Option<i32>,
        );
        let rows: Vec<MappingRow> = sqlx::query_as(
            r#"
            SELECT
                mapping_id, source_table, target_table, target_kind,
                target_spec, load_strategy, expected_ratio, chunk_size,
                load_priority, timeout_secs
            FROM table_mappings
            WHERE is_active = true
            ORDER BY load_priority DESC, mapping_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        rows.into_iter()
            .map(
                |(
                    mapping_id,
                    source_table,
                    target_table,
                    target_kind,
                    target_spec,
                    load_strategy,
                    expected_ratio,
                    chunk_size,
                    load_priority,
                    timeout_secs,
                )| {
                    let target = match target_kind.as_str() {
                        "DIMENSION" => {
                            let spec: DimensionSpec = serde_json::from_value(target_spec)
                                .map_err(|e| {
                                    metadata_error(format!(
                                        "mapping '{mapping_id}': bad dimension spec: {e}"
                                    ))
                                })?;
                            TargetKind::Dimension(spec)
                        }
                        "FACT" => {
                            let spec: FactSpec =
                                serde_json::from_value(target_spec).map_err(|e| {
                                    metadata_error(format!(
                                        "mapping '{mapping_id}': bad fact spec: {e}"
                                    ))
                                })?;
                            TargetKind::Fact(spec)
                        }
                        other => {
                            return Err(metadata_error(format!(
                                "mapping '{mapping_id}': unknown target kind '{other}'"
                            )))
                        }
                    };

                    Ok(MappingConfig {
                        mapping_id,
                        source_table,
                        target_table,
                        target,
                        columns: vec![],
                        mandatory_columns: vec![],
                        load_strategy: parse_load_strategy(&load_strategy)?,
                        expected_ratio,
                        chunk_size: chunk_size.max(1) as usize,
                        load_priority,
                        depends_on: vec![],
                        timeout_secs: timeout_secs.map(|t| t.max(0) as u64),
                    })
                },
            )
            .collect()
    }

    async fn fetch_column_mappings(
        &self,
    ) -> EtlResult<HashMap<String, Vec<(ColumnMapping, bool)>>> {
        let rows: Vec<(String, String, String, Value, bool)> = sqlx::query_as(
            r#"
            SELECT mapping_id, source_column, target_column, transform, is_mandatory
            FROM column_mappings
            ORDER BY mapping_id, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        let mut grouped: HashMap<String, Vec<(ColumnMapping, bool)>> = HashMap::new();
        for (mapping_id, source, target, transform, is_mandatory) in rows {
            let transform: TransformKind = serde_json::from_value(transform).map_err(|e| {
                metadata_error(format!("column '{target}' of '{mapping_id}': {e}"))
            })?;
            grouped.entry(mapping_id).or_default().push((
                ColumnMapping {
                    source,
                    target,
                    transform,
                },
                is_mandatory,
            ));
        }
        Ok(grouped)
    }

    async fn fetch_lookup_mappings(&self) -> EtlResult<HashMap<String, Vec<DimensionRef>>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT mapping_id, dimension_name, source_column, key_column
            FROM lookup_mappings
            ORDER BY mapping_id, dimension_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        let mut grouped: HashMap<String, Vec<DimensionRef>> = HashMap::new();
        for (mapping_id, dimension, source, key_column) in rows {
            grouped.entry(mapping_id).or_default().push(DimensionRef {
                dimension,
                source,
                key_column,
            });
        }
        Ok(grouped)
    }

    async fn fetch_dependencies(&self) -> EtlResult<HashMap<String, Vec<String>>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT mapping_id, depends_on
            FROM table_dependencies
            ORDER BY mapping_id, depends_on
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for (mapping_id, depends_on) in rows {
            grouped.entry(mapping_id).or_default().push(depends_on);
        }
        Ok(grouped)
    }

    async fn fetch_rules(&self) -> EtlResult<Vec<ValidationRule>> {
        type RuleRow = (String, String, String, Option<String>, Value, String, Value);
        let rows: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT rule_id, rule_name, target_table, column_name, rule, severity, action
            FROM data_quality_rules
            WHERE is_active = true
            ORDER BY rule_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| metadata_error(e.to_string()))?;

        rows.into_iter()
            .map(
                |(rule_id, name, table, column, rule, severity, action)| {
                    let kind: RuleKind = serde_json::from_value(rule)
                        .map_err(|e| metadata_error(format!("rule '{rule_id}': {e}")))?;
                    let action: RuleAction = serde_json::from_value(action)
                        .map_err(|e| metadata_error(format!("rule '{rule_id}': {e}")))?;
                    Ok(ValidationRule {
                        rule_id,
                        name,
                        table,
                        column,
                        kind,
                        severity: parse_severity(&severity)?,
                        action,
                    })
                },
            )
            .collect()
    }
}
