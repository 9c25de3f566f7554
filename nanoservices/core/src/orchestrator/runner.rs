//! Fans the catalog out into fetch tasks and runs them on a bounded worker pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, IngestionUnit, Iteration};
use crate::failures::{persist_failures, Activity, ErrorClass, FailureRecord, FailureSink};
use crate::landing::RawLanding;
use crate::orchestrator::task::{FetchTask, TaskContext, TaskOutcome};
use crate::sources::{KeyLookup, Upstream};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Fetch tasks in flight across the whole run.
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempt_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(50 * 60),
        }
    }
}

/// What one orchestrator pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub pages_landed: u64,
    pub pages_by_unit: BTreeMap<String, u64>,
    pub failures: Vec<FailureRecord>,
    /// Set when the run deadline or a cancellation cut the pass short.
    pub aborted: Option<ErrorClass>,
    /// Set when the failure sink rejected this pass's records.
    pub failure_sink_error: Option<String>,
}

impl IngestionReport {
    /// Units with at least one failure record this pass.
    pub fn failed_units(&self) -> HashSet<&str> {
        self.failures.iter().map(|f| f.unit.as_str()).collect()
    }
}

pub struct Orchestrator {
    upstream: Arc<dyn Upstream>,
    landing: Arc<dyn RawLanding>,
    warehouse: Arc<Warehouse>,
    failure_sink: Arc<dyn FailureSink>,
    lookups: BTreeMap<String, Arc<dyn KeyLookup>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        landing: Arc<dyn RawLanding>,
        warehouse: Arc<Warehouse>,
        failure_sink: Arc<dyn FailureSink>,
        lookups: BTreeMap<String, Arc<dyn KeyLookup>>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { upstream, landing, warehouse, failure_sink, lookups, settings }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Walk every unit of `catalog` once.
    ///
    /// Cancellation stops dispatch; tasks already running finish their current
    /// attempt and stop before the next page. The run deadline aborts the pass
    /// but keeps every page landed before it.
    pub async fn run(&self, catalog: &Catalog, run_id: &str, cancel: CancellationToken) -> IngestionReport {
        let deadline = tokio::time::Instant::now() + self.settings.run_timeout;
        let mut report = IngestionReport::default();

        let tasks = self.resolve_tasks(catalog, run_id, &mut report).await;
        tracing::info!(run = %run_id, tasks = tasks.len(), concurrency = self.settings.concurrency, "dispatching fetch tasks");

        let ctx = Arc::new(TaskContext {
            run_id: run_id.to_string(),
            upstream: self.upstream.clone(),
            landing: self.landing.clone(),
            warehouse: self.warehouse.clone(),
            attempt_timeout: self.settings.attempt_timeout,
            deadline,
            cancel: cancel.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(tasks.len().max(1));

        let mut pending = tasks.into_iter();
        while let Some(task) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ErrorClass::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(ErrorClass::RunTimeout),
                permit = semaphore.clone().acquire_owned() => permit.map_err(|_| ErrorClass::Cancelled),
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(class) => {
                    report.aborted = Some(class);
                    tracing::warn!(run = %run_id, class = %class, remaining = pending.len() + 1, "dispatch stopped");
                    for skipped in std::iter::once(task).chain(pending.by_ref()) {
                        report.tasks_failed += 1;
                        report.failures.push(
                            FailureRecord::new(&skipped.unit.name, skipped.key.as_deref(), Activity::Fetch, class, run_id)
                                .message("task not started"),
                        );
                    }
                    break;
                }
            };

            let ctx = ctx.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let outcome = ctx.run(task).await;
                drop(permit);
                let _ = result_tx.send(outcome).await;
            });
        }
        drop(result_tx);

        while let Some(outcome) = result_rx.recv().await {
            *report.pages_by_unit.entry(outcome.unit.clone()).or_default() += outcome.pages_landed;
            report.pages_landed += outcome.pages_landed;
            match outcome.failure {
                None => {
                    report.tasks_succeeded += 1;
                    tracing::debug!(run = %run_id, unit = %outcome.unit, key = ?outcome.key, pages = outcome.pages_landed, duration_ms = outcome.duration_ms, "fetch task completed");
                }
                Some(failure) => {
                    report.tasks_failed += 1;
                    if report.aborted.is_none() && failure.class == ErrorClass::RunTimeout {
                        report.aborted = Some(ErrorClass::RunTimeout);
                    }
                    tracing::warn!(run = %run_id, unit = %failure.unit, key = ?failure.key, class = %failure.class, error = %failure.message, "fetch task failed");
                    report.failures.push(failure);
                }
            }
        }
        if report.aborted.is_none() && cancel.is_cancelled() {
            report.aborted = Some(ErrorClass::Cancelled);
        }

        if let Err(e) = persist_failures(self.failure_sink.as_ref(), run_id, &report.failures) {
            report.failure_sink_error = Some(e.to_string());
        }
        tracing::info!(
            run = %run_id,
            succeeded = report.tasks_succeeded,
            failed = report.tasks_failed,
            pages = report.pages_landed,
            "ingestion pass finished"
        );
        report
    }

    /// One task per unit, or one per key for units that iterate over a lookup.
    /// Keys are resolved once per lookup per run.
    async fn resolve_tasks(&self, catalog: &Catalog, run_id: &str, report: &mut IngestionReport) -> Vec<FetchTask> {
        let mut resolved: HashMap<String, Result<Vec<String>, String>> = HashMap::new();
        let mut tasks = Vec::new();

        for unit in catalog.units() {
            let Iteration::Lookup { lookup, .. } = &unit.iteration else {
                tasks.push(FetchTask { unit: unit.clone(), key: None });
                continue;
            };
            if !resolved.contains_key(lookup) {
                let keys = self.lookup_keys(lookup).await;
                resolved.insert(lookup.clone(), keys);
            }
            match &resolved[lookup] {
                Ok(keys) if keys.is_empty() => {
                    tracing::info!(run = %run_id, unit = %unit.name, lookup = %lookup, "lookup returned no keys, unit skipped");
                }
                Ok(keys) => tasks.extend(keys.iter().map(|key| FetchTask { unit: unit.clone(), key: Some(key.clone()) })),
                Err(message) => {
                    tracing::error!(run = %run_id, unit = %unit.name, lookup = %lookup, error = %message, "key lookup failed");
                    report.failures.push(lookup_failure(unit, run_id, message));
                }
            }
        }
        tasks
    }

    async fn lookup_keys(&self, name: &str) -> Result<Vec<String>, String> {
        let lookup = self.lookups.get(name).ok_or_else(|| format!("lookup {name} is not registered"))?;
        let keys = match tokio::time::timeout(self.settings.attempt_timeout, lookup.keys()).await {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("lookup {name} timed out")),
        };
        let mut seen = HashSet::new();
        Ok(keys.into_iter().filter(|k| !k.is_empty() && seen.insert(k.clone())).collect())
    }
}

fn lookup_failure(unit: &IngestionUnit, run_id: &str, message: &str) -> FailureRecord {
    FailureRecord::new(&unit.name, None, Activity::Lookup, ErrorClass::Permanent, run_id).message(message)
}
