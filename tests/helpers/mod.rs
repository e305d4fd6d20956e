//! Shared builders for engine integration tests
#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;

use taxdw_etl::audit::InMemoryAuditLog;
use taxdw_etl::config::{
    CalendarRange, ColumnMapping, DateRole, DimensionRef, DimensionSpec, FactSpec, FieldSpec,
    LoadStrategy, MappingConfig, RunManifest, RunSettings, ScdKind, TargetKind, TransformKind,
    ValidationRule,
};
use taxdw_etl::extract::MemoryExtractor;
use taxdw_etl::model::SourceRow;
use taxdw_etl::sequence::InMemoryKeySequence;
use taxdw_etl::sink::MemorySink;
use taxdw_etl::EtlEngine;

pub fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
}

pub fn settings() -> RunSettings {
    RunSettings {
        as_of: as_of(),
        max_parallel_workers: 4,
        stop_on_error: true,
        calendar_range: Some(CalendarRange {
            min: 20200101,
            max: 20301231,
        }),
    }
}

/// dim_country: SCD2 over country_code, tracking currency_code
pub fn country_mapping() -> MappingConfig {
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

/// dim_party: SCD2 over party_id
pub fn party_mapping() -> MappingConfig {
    MappingConfig {
        mapping_id: "map_dim_party".to_string(),
        source_table: "l2_party".to_string(),
        target_table: "dim_party".to_string(),
        target: TargetKind::Dimension(DimensionSpec {
            dimension: "party".to_string(),
            natural_key: "party_id".to_string(),
            scd: ScdKind::Type2,
            tracked_columns: vec![],
            retire_missing: false,
        }),
        columns: vec![ColumnMapping {
            source: "party_name".to_string(),
            target: "party_name".to_string(),
            transform: TransformKind::Trim,
        }],
        mandatory_columns: vec!["party_id".to_string()],
        load_strategy: LoadStrategy::Full,
        expected_ratio: 1.0,
        chunk_size: 1_000,
        load_priority: 0,
        depends_on: vec![],
        timeout_secs: None,
    }
}

/// fact_filing referencing dim_party, with a filing date role and one
/// financial measure
pub fn filing_mapping() -> MappingConfig {
    MappingConfig {
        mapping_id: "map_fact_filing".to_string(),
        source_table: "l2_filing".to_string(),
        target_table: "fact_filing".to_string(),
        target: TargetKind::Fact(FactSpec {
            dimension_refs: vec![DimensionRef {
                dimension: "party".to_string(),
                source: "party_id".to_string(),
                key_column: "party_key".to_string(),
            }],
            date_roles: vec![DateRole {
                role: "filing".to_string(),
                source: "filing_date".to_string(),
                key_column: "filing_date_key".to_string(),
            }],
            degenerate_ids: vec![FieldSpec {
                source: "filing_ref".to_string(),
                target: "filing_ref".to_string(),
            }],
            measures: vec![FieldSpec {
                source: "amount".to_string(),
                target: "amount_due".to_string(),
            }],
            flags: vec![],
        }),
        columns: vec![],
        mandatory_columns: vec!["filing_ref".to_string()],
        load_strategy: LoadStrategy::Full,
        expected_ratio: 1.0,
        chunk_size: 1_000,
        load_priority: 0,
        depends_on: vec!["map_dim_party".to_string()],
        timeout_secs: None,
    }
}

pub fn manifest(mappings: Vec<MappingConfig>, rules: Vec<ValidationRule>) -> RunManifest {
    RunManifest {
        settings: settings(),
        mappings,
        rules,
    }
}

pub fn country_row(code: &str, currency: &str) -> SourceRow {
    SourceRow::from_pairs([("country_code", json!(code)), ("currency", json!(currency))])
}

pub fn party_row(id: &str, name: &str) -> SourceRow {
    SourceRow::from_pairs([("party_id", json!(id)), ("party_name", json!(name))])
}

pub fn filing_row(reference: &str, party: &str, date: &str, amount: f64) -> SourceRow {
    SourceRow::from_pairs([
        ("filing_ref", json!(reference)),
        ("party_id", json!(party)),
        ("filing_date", json!(date)),
        ("amount", json!(amount)),
    ])
}

/// Engine over shared in-memory seams. Rebuild per run to swap source data;
/// the sink, sequence and audit log persist across runs.
pub fn engine(
    extractor: MemoryExtractor,
    sink: &Arc<MemorySink>,
    sequence: &Arc<InMemoryKeySequence>,
    audit: &Arc<InMemoryAuditLog>,
) -> EtlEngine {
    EtlEngine::new(
        Arc::new(extractor),
        Arc::clone(sink) as Arc<dyn taxdw_etl::sink::Sink>,
        Arc::clone(sequence) as Arc<dyn taxdw_etl::sequence::KeySequenceService>,
        Arc::clone(audit) as Arc<dyn taxdw_etl::audit::AuditLog>,
    )
}

pub fn memory_seams() -> (
    Arc<MemorySink>,
    Arc<InMemoryKeySequence>,
    Arc<InMemoryAuditLog>,
) {
    (
        Arc::new(MemorySink::new()),
        Arc::new(InMemoryKeySequence::new()),
        Arc::new(InMemoryAuditLog::new()),
    )
}
