//! Run engine: wires the seams, drives the phases, produces the report
//!
//! One `EtlEngine` owns the injected collaborators (extractor, sink, key
//! sequence, audit log). A run validates the manifest, orders the graph,
//! executes the dimension phase, freezes the lookup caches, executes the
//! fact phase, then runs all validators and assembles the final report.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::{MappingConfig, RunManifest, TargetKind, ValidationRule};
use crate::dimension::{apply_plan, plan_dimension_load};
use crate::error::{ConnectionError, EtlError, EtlResult};
use crate::extract::Extractor;
use crate::fact::load_fact;
use crate::model::{ExecutionRecord, ExecutionStatus, RowCounts, ValidationStatus};
use crate::orchestrator::{execute_phase, skip_phase, split_phases, topological_order, TaskRunner};
use crate::resolver::KeyLookupCache;
use crate::sequence::KeySequenceService;
use crate::sink::Sink;
use crate::validation::{apply_row_actions, run_validations, LoadSummary, ValidationReport};

/// Final result of one orchestrated run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
    /// FAIL if any mapping failed or any error-severity check failed
    pub status: ValidationStatus,
    pub executions: Vec<ExecutionRecord>,
    pub validation: ValidationReport,
}

impl RunReport {
    /// Process exit code: 0 unless the aggregate status is FAIL
    pub fn exit_code(&self) -> i32 {
        if self.status == ValidationStatus::Fail {
            1
        } else {
            0
        }
    }

    /// Report surface consumed by the external renderer
    pub fn report_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "as_of": self.as_of,
            "status": self.status,
            "summary": self.validation.summary,
            "validators": {
                "row_count": self.validation.row_count,
                "referential_integrity": self.validation.referential_integrity,
                "data_quality": self.validation.data_quality,
                "business_rules": self.validation.business_rules,
            },
            "executions": self.executions,
        })
    }
}

async fn with_timeout<T, F>(
    timeout_secs: Option<u64>,
    operation: &str,
    future: F,
) -> EtlResult<T>
where
    F: Future<Output = EtlResult<T>>,
{
    match timeout_secs {
        None => future.await,
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), future).await {
            Ok(result) => result,
            Err(_) => Err(EtlError::Connection(ConnectionError::Timeout {
                operation: operation.to_string(),
                duration_ms: secs * 1_000,
            })),
        },
    }
}

/// Shared task state: the runner appends load summaries as tasks finish and
/// reads the caches frozen at the phase barrier.
struct EngineTaskRunner {
    extractor: Arc<dyn Extractor>,
    sink: Arc<dyn Sink>,
    sequence: Arc<dyn KeySequenceService>,
    audit: Arc<dyn AuditLog>,
    rules: Vec<ValidationRule>,
    as_of: NaiveDate,
    caches: Arc<RwLock<HashMap<String, Arc<KeyLookupCache>>>>,
    summaries: Arc<Mutex<Vec<LoadSummary>>>,
}

impl EngineTaskRunner {
    async fn execute(&self, mapping: &MappingConfig) -> EtlResult<(RowCounts, u64)> {
        let extracted = with_timeout(
            mapping.timeout_secs,
            "extract",
            self.extractor.extract(mapping, self.as_of),
        )
        .await?;
        let extracted_count = extracted.len() as u64;

        let action_outcome =
            apply_row_actions(&self.rules, &mapping.target_table, extracted)?;
        let action_rejected = action_outcome.rejected;
        let rows = action_outcome.rows;

        match &mapping.target {
            TargetKind::Dimension(spec) => {
                let current = self
                    .sink
                    .fetch_current_dimension(&mapping.target_table)
                    .await?;
                let plan = plan_dimension_load(
                    mapping,
                    spec,
                    &rows,
                    &current,
                    self.as_of,
                    self.sequence.as_ref(),
                )
                .await?;
                let outcome = with_timeout(
                    mapping.timeout_secs,
                    "load",
                    apply_plan(self.sink.as_ref(), &mapping.target_table, &plan),
                )
                .await?;

                let rejected = action_rejected + plan.rejected;
                // A dimension reconciles source keys against its current rows
                let target_count = self
                    .sink
                    .fetch_current_dimension(&mapping.target_table)
                    .await?
                    .len() as u64;

                Ok((
                    RowCounts {
                        extracted: extracted_count,
                        validated: extracted_count - rejected,
                        rejected,
                        loaded: outcome.loaded,
                    },
                    target_count,
                ))
            }
            TargetKind::Fact(spec) => {
                let caches = self.caches.read().await.clone();
                let outcome = with_timeout(
                    mapping.timeout_secs,
                    "load",
                    load_fact(mapping, spec, &rows, &caches, self.sink.as_ref()),
                )
                .await?;

                let rejected = action_rejected + outcome.rejected;
                Ok((
                    RowCounts {
                        extracted: extracted_count,
                        validated: extracted_count - rejected,
                        rejected,
                        loaded: outcome.loaded,
                    },
                    // The loader's reported count feeds the row-count check
                    outcome.loaded,
                ))
            }
        }
    }
}

#[async_trait]
impl TaskRunner for EngineTaskRunner {
    async fn run_mapping(&self, mapping: MappingConfig) -> ExecutionRecord {
        let record = ExecutionRecord::open(&mapping.mapping_id);
        info!(mapping = %mapping.mapping_id, "mapping started");

        let sealed = match self.execute(&mapping).await {
            Ok((counts, target_count)) => {
                self.summaries.lock().await.push(LoadSummary {
                    mapping_id: mapping.mapping_id.clone(),
                    target_table: mapping.target_table.clone(),
                    source_count: counts.extracted,
                    target_count,
                    expected_ratio: mapping.expected_ratio,
                });
                record.seal(ExecutionStatus::Succeeded, counts, None)
            }
            Err(e) => {
                error!(mapping = %mapping.mapping_id, error = %e, "mapping failed");
                record.seal(ExecutionStatus::Failed, RowCounts::default(), Some(e.to_string()))
            }
        };

        if let Err(e) = self.audit.append(&sealed).await {
            error!(mapping = %mapping.mapping_id, error = %e, "audit append failed");
        }
        sealed
    }
}

/// The dimensional ETL engine
pub struct EtlEngine {
    extractor: Arc<dyn Extractor>,
    sink: Arc<dyn Sink>,
    sequence: Arc<dyn KeySequenceService>,
    audit: Arc<dyn AuditLog>,
}

impl EtlEngine {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        sink: Arc<dyn Sink>,
        sequence: Arc<dyn KeySequenceService>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            extractor,
            sink,
            sequence,
            audit,
        }
    }

    /// Execute one full run: dimension phase, cache freeze, fact phase,
    /// validation, report.
    pub async fn run(&self, manifest: &RunManifest) -> EtlResult<RunReport> {
        manifest.validate()?;
        // A cycle terminates the run before any extraction begins
        topological_order(&manifest.mappings)?;

        let run_id = Uuid::new_v4();
        info!(%run_id, as_of = %manifest.settings.as_of, "run started");

        let caches = Arc::new(RwLock::new(HashMap::new()));
        let summaries = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(EngineTaskRunner {
            extractor: Arc::clone(&self.extractor),
            sink: Arc::clone(&self.sink),
            sequence: Arc::clone(&self.sequence),
            audit: Arc::clone(&self.audit),
            rules: manifest.rules.clone(),
            as_of: manifest.settings.as_of,
            caches: Arc::clone(&caches),
            summaries: Arc::clone(&summaries),
        });

        let (dimensions, facts) = split_phases(&manifest.mappings);

        let mut executions = execute_phase(
            dimensions,
            &manifest.settings,
            &HashSet::new(),
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
        )
        .await?;

        let failed_upstream: HashSet<String> = executions
            .iter()
            .filter(|r| r.status != ExecutionStatus::Succeeded)
            .map(|r| r.mapping_id.clone())
            .collect();

        // Phase barrier: freeze one lookup cache per dimension before any
        // fact task starts
        {
            let mut frozen = caches.write().await;
            for mapping in &manifest.mappings {
                if let Some(spec) = mapping.dimension_spec() {
                    let current = self.sink.fetch_current_dimension(&mapping.target_table).await?;
                    frozen.insert(
                        spec.dimension.clone(),
                        Arc::new(KeyLookupCache::build(spec.dimension.clone(), &current)),
                    );
                }
            }
        }

        let any_dimension_failed = executions
            .iter()
            .any(|r| r.status == ExecutionStatus::Failed);
        let fact_records = if any_dimension_failed && manifest.settings.stop_on_error {
            skip_phase(facts, "run halted by dimension-phase failure")
        } else {
            execute_phase(
                facts,
                &manifest.settings,
                &failed_upstream,
                Arc::clone(&runner) as Arc<dyn TaskRunner>,
            )
            .await?
        };
        executions.extend(fact_records);

        // Runner tasks audit themselves; skipped mappings are recorded here
        for record in executions
            .iter()
            .filter(|r| r.status == ExecutionStatus::Skipped)
        {
            self.audit.append(record).await?;
        }

        let summaries = summaries.lock().await.clone();
        let validation = run_validations(self.sink.as_ref(), manifest, &summaries).await?;

        let any_task_failed = executions
            .iter()
            .any(|r| r.status == ExecutionStatus::Failed);
        let status = if any_task_failed || validation.is_failed() {
            ValidationStatus::Fail
        } else {
            validation.overall_status()
        };

        info!(%run_id, ?status, checks = validation.summary.total_checks, "run finished");
        Ok(RunReport {
            run_id,
            as_of: manifest.settings.as_of,
            status,
            executions,
            validation,
        })
    }
}
