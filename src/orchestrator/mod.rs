//! Dependency orchestration: topological scheduling over a bounded pool
//!
//! The mapping dependency graph is an adjacency list; Kahn's algorithm
//! orders it and any residual node is a fatal configuration error raised
//! before extraction begins. Execution happens in two phases separated by
//! the dimension -> fact barrier (the engine builds lookup caches between
//! them). Within a phase, ready tasks run concurrently bounded by
//! `max_parallel_workers`; siblings with no edge between them have no
//! relative ordering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{MappingConfig, RunSettings};
use crate::error::{DependencyCycleError, EtlResult};
use crate::model::{ExecutionRecord, ExecutionStatus, RowCounts};

/// Executes one mapping end to end and returns its sealed audit record.
/// A record with `status == Failed` triggers skip propagation; the runner
/// itself never propagates task errors as scheduler errors.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_mapping(&self, mapping: MappingConfig) -> ExecutionRecord;
}

/// Kahn's topological sort over the declared dependency edges.
///
/// Returns the mapping ids in a valid execution order, or the members of
/// the residual (cyclic) subgraph.
pub fn topological_order(mappings: &[MappingConfig]) -> Result<Vec<String>, DependencyCycleError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for mapping in mappings {
        indegree.entry(mapping.mapping_id.as_str()).or_insert(0);
        for dep in &mapping.depends_on {
            *indegree.entry(mapping.mapping_id.as_str()).or_insert(0) += 1;
            children
                .entry(dep.as_str())
                .or_default()
                .push(mapping.mapping_id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = {
        let mut zero: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        zero.sort_unstable();
        zero.into()
    };

    let mut order = Vec::with_capacity(mappings.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        for child in children.get(id).into_iter().flatten() {
            let degree = indegree.get_mut(child).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(child);
            }
        }
    }

    if order.len() != indegree.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut members: Vec<String> = indegree
            .keys()
            .filter(|id| !ordered.contains(**id))
            .map(|id| id.to_string())
            .collect();
        members.sort();
        return Err(DependencyCycleError { members });
    }

    Ok(order)
}

/// Seal a never-started record as skipped
fn skipped_record(mapping_id: &str, reason: &str) -> ExecutionRecord {
    ExecutionRecord::open(mapping_id).seal(
        ExecutionStatus::Skipped,
        RowCounts::default(),
        Some(reason.to_string()),
    )
}

/// Cancel a whole phase that never starts, e.g. the fact phase after a
/// dimension failure under `stop_on_error`
pub fn skip_phase(mappings: Vec<MappingConfig>, reason: &str) -> Vec<ExecutionRecord> {
    mappings
        .iter()
        .map(|m| skipped_record(&m.mapping_id, reason))
        .collect()
}

/// Run one phase of mappings on the worker pool.
///
/// `failed_upstream` carries failed or skipped mapping ids from earlier
/// phases; their descendants in this phase are skipped without starting.
/// With `stop_on_error`, the first failure also skips every task that has
/// not started yet; running siblings finish and stay committed.
pub async fn execute_phase(
    mappings: Vec<MappingConfig>,
    settings: &RunSettings,
    failed_upstream: &HashSet<String>,
    runner: Arc<dyn TaskRunner>,
) -> EtlResult<Vec<ExecutionRecord>> {
    let mut records: Vec<ExecutionRecord> = Vec::with_capacity(mappings.len());
    if mappings.is_empty() {
        return Ok(records);
    }

    let ids: HashSet<String> = mappings.iter().map(|m| m.mapping_id.clone()).collect();
    let mut configs: HashMap<String, MappingConfig> = mappings
        .into_iter()
        .map(|m| (m.mapping_id.clone(), m))
        .collect();

    // In-phase edges only; cross-phase ancestors are either complete or in
    // failed_upstream.
    let mut indegree: HashMap<String, usize> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for (id, mapping) in &configs {
        let degree = mapping
            .depends_on
            .iter()
            .filter(|dep| ids.contains(*dep))
            .count();
        indegree.insert(id.clone(), degree);
        for dep in &mapping.depends_on {
            if ids.contains(dep) {
                children.entry(dep.clone()).or_default().push(id.clone());
            }
        }
    }

    let mut done: HashSet<String> = HashSet::new();
    let mut failed: HashSet<String> = failed_upstream.clone();

    // Skip anything whose upstream already failed, transitively
    let mut to_skip: VecDeque<String> = configs
        .values()
        .filter(|m| m.depends_on.iter().any(|d| failed.contains(d)))
        .map(|m| m.mapping_id.clone())
        .collect();
    while let Some(id) = to_skip.pop_front() {
        if done.contains(&id) {
            continue;
        }
        warn!(mapping = %id, "skipping: upstream dependency failed");
        records.push(skipped_record(&id, "upstream dependency failed"));
        done.insert(id.clone());
        failed.insert(id.clone());
        for child in children.get(&id).into_iter().flatten() {
            to_skip.push_back(child.clone());
        }
    }

    let mut ready: Vec<String> = indegree
        .iter()
        .filter(|(id, d)| **d == 0 && !done.contains(*id))
        .map(|(id, _)| id.clone())
        .collect();
    // Higher load priority first, then id for determinism
    ready.sort_by(|a, b| {
        let pa = configs[a].load_priority;
        let pb = configs[b].load_priority;
        pb.cmp(&pa).then_with(|| a.cmp(b))
    });
    let mut ready: VecDeque<String> = ready.into();

    let semaphore = Arc::new(Semaphore::new(settings.max_parallel_workers.max(1)));
    let mut join_set: JoinSet<ExecutionRecord> = JoinSet::new();
    let mut halted = false;

    loop {
        while let Some(id) = ready.pop_front() {
            if halted {
                records.push(skipped_record(&id, "run halted by earlier failure"));
                done.insert(id);
                continue;
            }
            let Some(mapping) = configs.remove(&id) else {
                continue;
            };
            let permit_source = Arc::clone(&semaphore);
            let task_runner = Arc::clone(&runner);
            join_set.spawn(async move {
                let _permit = permit_source
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                task_runner.run_mapping(mapping).await
            });
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let record = match joined {
            Ok(record) => record,
            Err(join_error) => {
                // A panicking task counts as a failure of unknown mapping;
                // halt conservatively.
                warn!(error = %join_error, "mapping task aborted");
                halted = settings.stop_on_error;
                continue;
            }
        };

        let id = record.mapping_id.clone();
        let task_failed = record.status == ExecutionStatus::Failed;
        done.insert(id.clone());
        records.push(record);

        if task_failed {
            failed.insert(id.clone());
            if settings.stop_on_error {
                info!(mapping = %id, "failure with stop_on_error, cancelling pending tasks");
                halted = true;
            }
            // Descendants are skipped either way
            let mut queue: VecDeque<String> =
                children.get(&id).cloned().unwrap_or_default().into();
            while let Some(child) = queue.pop_front() {
                if done.contains(&child) || failed.contains(&child) {
                    continue;
                }
                records.push(skipped_record(&child, "upstream dependency failed"));
                done.insert(child.clone());
                failed.insert(child.clone());
                configs.remove(&child);
                ready.retain(|r| r != &child);
                for grandchild in children.get(&child).into_iter().flatten() {
                    queue.push_back(grandchild.clone());
                }
            }
        } else {
            for child in children.get(&id).cloned().unwrap_or_default() {
                if done.contains(&child) || failed.contains(&child) {
                    continue;
                }
                if let Some(degree) = indegree.get_mut(&child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 && configs.contains_key(&child) {
                        ready.push_back(child);
                    }
                }
            }
        }
    }

    // Anything never reached (e.g. halted before its parents ran)
    let mut remaining: Vec<String> = configs.keys().cloned().collect();
    remaining.sort();
    for id in remaining {
        if !done.contains(&id) {
            records.push(skipped_record(&id, "run halted by earlier failure"));
        }
    }

    Ok(records)
}

/// Split mappings at the phase barrier: every dimension mapping completes
/// (and its cache freezes) before any fact mapping starts.
pub fn split_phases(mappings: &[MappingConfig]) -> (Vec<MappingConfig>, Vec<MappingConfig>) {
    let (dimensions, facts): (Vec<_>, Vec<_>) =
        mappings.iter().cloned().partition(MappingConfig::is_dimension);
    (dimensions, facts)
}
