//! Post-load validation: four independent validators, one aggregated report
//!
//! Row count, referential integrity, data quality and business rules each
//! produce a list of named results; the engine aggregates them into one
//! report with an overall status. A validation failure is never an error:
//! it is accumulated, reported, and reflected in the process exit code.

use serde::{Deserialize, Serialize};

use crate::config::RunManifest;
use crate::error::EtlResult;
use crate::model::{ValidationResult, ValidationStatus};
use crate::sink::Sink;

mod business;
mod quality;
mod referential;
mod row_count;

pub use business::validate_business_rules;
pub use quality::{apply_row_actions, validate_quality_rules, RowActionOutcome};
pub use referential::validate_referential_integrity;
pub use row_count::validate_row_counts;

/// Per-mapping figures handed from the load phase to the validators.
///
/// `target_count` is the count the loader reported from the sink; the
/// validator never re-derives it from the source side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub mapping_id: String,
    pub target_table: String,
    pub source_count: u64,
    pub target_count: u64,
    pub expected_ratio: f64,
}

/// Aggregate counters over every check in the report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_checks: u64,
    pub passed: u64,
    pub failed: u64,
    pub warnings: u64,
    pub pass_rate: f64,
}

/// The aggregated validation report, grouped by validator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub summary: ValidationSummary,
    pub row_count: Vec<ValidationResult>,
    pub referential_integrity: Vec<ValidationResult>,
    pub data_quality: Vec<ValidationResult>,
    pub business_rules: Vec<ValidationResult>,
}

impl ValidationReport {
    fn checks(&self) -> impl Iterator<Item = &ValidationResult> {
        self.row_count
            .iter()
            .chain(self.referential_integrity.iter())
            .chain(self.data_quality.iter())
            .chain(self.business_rules.iter())
    }

    fn recompute_summary(&mut self) {
        let mut summary = ValidationSummary::default();
        for check in self.checks() {
            summary.total_checks += 1;
            match check.status {
                ValidationStatus::Pass => summary.passed += 1,
                ValidationStatus::Fail => summary.failed += 1,
                ValidationStatus::Warn => summary.warnings += 1,
            }
        }
        summary.pass_rate = if summary.total_checks == 0 {
            1.0
        } else {
            summary.passed as f64 / summary.total_checks as f64
        };
        self.summary = summary;
    }

    /// FAIL iff any error-severity check failed. Warning-only findings
    /// leave the run passing but stay visible in the report.
    pub fn overall_status(&self) -> ValidationStatus {
        if self.summary.failed > 0 {
            ValidationStatus::Fail
        } else if self.summary.warnings > 0 {
            ValidationStatus::Warn
        } else {
            ValidationStatus::Pass
        }
    }

    pub fn is_failed(&self) -> bool {
        self.overall_status() == ValidationStatus::Fail
    }

    /// Every failing or warning check, for operator-facing output
    pub fn findings(&self) -> Vec<&ValidationResult> {
        self.checks()
            .filter(|c| c.status != ValidationStatus::Pass)
            .collect()
    }
}

/// Run all four validators and aggregate the report
pub async fn run_validations(
    sink: &dyn Sink,
    manifest: &RunManifest,
    summaries: &[LoadSummary],
) -> EtlResult<ValidationReport> {
    let mut report = ValidationReport {
        row_count: validate_row_counts(summaries),
        referential_integrity: validate_referential_integrity(sink, &manifest.mappings).await?,
        data_quality: validate_quality_rules(sink, manifest).await?,
        business_rules: validate_business_rules(sink, manifest).await?,
        ..ValidationReport::default()
    };
    report.recompute_summary();
    Ok(report)
}
