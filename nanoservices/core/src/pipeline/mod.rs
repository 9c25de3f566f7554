//! One pipeline cycle: ingest, structure, merge, enrich, aggregate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use transitflow_utils::TransitFlowResult;

use crate::aggregate::{run_aggregations, Aggregation, AggregationReport};
use crate::catalog::Catalog;
use crate::config::types::JoinConfig;
use crate::enrich::{EnrichmentReport, EnrichmentResolver};
use crate::events::trigger::Trigger;
use crate::ingest::{IngestReport, SchemaEvolvingIngestor};
use crate::merge::{Curation, MergeEngine, MergeReport};
use crate::orchestrator::{IngestionReport, Orchestrator};
use crate::warehouse::{now_rfc3339, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Every task and every table went through.
    Completed,
    /// Some tasks failed or some tables halted; everything else committed.
    Partial,
    /// Cancelled or past the run deadline; downstream stages skipped.
    Aborted,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Partial => "partial",
            CycleStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cycle did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: String,
    pub pipeline: String,
    pub status: CycleStatus,
    pub started_at: String,
    pub duration_ms: u64,
    pub ingestion: IngestionReport,
    pub raw: Vec<IngestReport>,
    pub merges: Vec<MergeReport>,
    pub enrichment: Vec<EnrichmentReport>,
    pub aggregations: AggregationReport,
    /// Tables halted this cycle, with the reason. Needs an operator for structural failures.
    pub halted: BTreeMap<String, String>,
}

impl CycleSummary {
    pub fn rows_rejected(&self) -> BTreeMap<String, usize> {
        let mut totals = BTreeMap::new();
        for merge in &self.merges {
            for (reason, count) in &merge.rows_rejected {
                *totals.entry(reason.clone()).or_default() += count;
            }
        }
        totals
    }

    pub fn rows_merged(&self) -> usize {
        self.merges.iter().map(|m| m.inserted + m.updated).sum()
    }

    pub fn merge_for(&self, unit: &str) -> Option<&MergeReport> {
        self.merges.iter().find(|m| m.unit == unit)
    }
}

pub struct Pipeline {
    name: String,
    catalog: Catalog,
    curations: BTreeMap<String, Curation>,
    enrichment: BTreeMap<String, Vec<JoinConfig>>,
    orchestrator: Orchestrator,
    ingestor: SchemaEvolvingIngestor,
    merge: MergeEngine,
    resolver: EnrichmentResolver,
    aggregations: Vec<Arc<dyn Aggregation>>,
    warehouse: Arc<Warehouse>,
    cycle_lock: Mutex<()>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        catalog: Catalog,
        curations: BTreeMap<String, Curation>,
        enrichment: BTreeMap<String, Vec<JoinConfig>>,
        orchestrator: Orchestrator,
        ingestor: SchemaEvolvingIngestor,
        merge: MergeEngine,
        aggregations: Vec<Arc<dyn Aggregation>>,
        warehouse: Arc<Warehouse>,
    ) -> Self {
        Self {
            name: name.into(),
            catalog,
            curations,
            enrichment,
            orchestrator,
            ingestor,
            merge,
            resolver: EnrichmentResolver::new(warehouse.clone()),
            aggregations,
            warehouse,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn warehouse(&self) -> &Arc<Warehouse> {
        &self.warehouse
    }

    /// Run one full cycle under `run_id`.
    pub async fn run_cycle(&self, run_id: &str) -> TransitFlowResult<CycleSummary> {
        self.run_cycle_with_cancel(run_id, &Trigger::Manual, CancellationToken::new()).await
    }

    /// Run one full cycle. Cycles of one pipeline never overlap; a second
    /// caller waits for the running cycle to finish.
    pub async fn run_cycle_with_cancel(
        &self,
        run_id: &str,
        trigger: &Trigger,
        cancel: CancellationToken,
    ) -> TransitFlowResult<CycleSummary> {
        let _cycle = self.cycle_lock.lock().await;
        let start = Instant::now();
        let started_at = now_rfc3339();
        self.warehouse.insert_cycle_run(run_id, &self.name, trigger.kind(), &started_at)?;
        tracing::info!(pipeline = %self.name, run = %run_id, trigger = trigger.kind(), "cycle started");

        let ingestion = self.orchestrator.run(&self.catalog, run_id, cancel.clone()).await;
        let mut summary = CycleSummary {
            run_id: run_id.to_string(),
            pipeline: self.name.clone(),
            status: CycleStatus::Completed,
            started_at,
            duration_ms: 0,
            ingestion,
            raw: Vec::new(),
            merges: Vec::new(),
            enrichment: Vec::new(),
            aggregations: AggregationReport::default(),
            halted: BTreeMap::new(),
        };

        if let Some(class) = summary.ingestion.aborted {
            tracing::warn!(pipeline = %self.name, run = %run_id, class = %class, "ingestion aborted, downstream stages skipped");
            summary.status = CycleStatus::Aborted;
        } else {
            self.downstream(&mut summary, &cancel).await;
        }

        let status = if summary.status == CycleStatus::Aborted || cancel.is_cancelled() {
            CycleStatus::Aborted
        } else if summary.ingestion.failures.is_empty()
            && summary.ingestion.failure_sink_error.is_none()
            && summary.halted.is_empty()
            && summary.aggregations.failed.is_empty()
        {
            CycleStatus::Completed
        } else {
            CycleStatus::Partial
        };
        self.finish(&mut summary, start, status);
        Ok(summary)
    }

    /// Structure, merge, enrich and aggregate. Failures stay inside their table
    /// or aggregation.
    async fn downstream(&self, summary: &mut CycleSummary, cancel: &CancellationToken) {
        for unit in self.catalog.units() {
            match self.ingestor.ingest_unit(unit).await {
                Ok(report) => {
                    if let Some(reason) = &report.structural {
                        summary.halted.insert(unit.name.clone(), reason.clone());
                    }
                    summary.raw.push(report);
                }
                Err(e) => {
                    tracing::error!(unit = %unit.name, error = %e, "raw ingestion failed");
                    summary.halted.insert(unit.name.clone(), e.to_string());
                }
            }
        }
        if cancel.is_cancelled() {
            summary.status = CycleStatus::Aborted;
            return;
        }

        for (unit, curation) in &self.curations {
            if summary.halted.contains_key(unit) {
                continue;
            }
            match self.merge.run_cycle(curation) {
                Ok(report) => summary.merges.push(report),
                Err(e) => {
                    tracing::error!(unit = %unit, error = %e, "merge failed");
                    summary.halted.insert(unit.clone(), e.to_string());
                }
            }
        }

        for merge in &summary.merges {
            let Some(curation) = self.curations.get(&merge.unit) else { continue };
            let joins = self.enrichment.get(&merge.unit).map(Vec::as_slice).unwrap_or(&[]);
            match self.resolver.resolve(&merge.unit, &curation.field_types(), joins, &merge.keys) {
                Ok(report) => summary.enrichment.push(report),
                Err(e) => {
                    tracing::error!(unit = %merge.unit, error = %e, "enrichment failed");
                    summary.halted.insert(merge.unit.clone(), e.to_string());
                }
            }
        }

        let halted: Vec<String> = summary.halted.keys().cloned().collect();
        summary.aggregations = run_aggregations(&self.warehouse, &self.aggregations, &halted);
    }

    fn finish(&self, summary: &mut CycleSummary, start: Instant, status: CycleStatus) {
        summary.status = status;
        summary.duration_ms = start.elapsed().as_millis() as u64;

        let json = serde_json::to_string(summary).unwrap_or_default();
        if let Err(e) = self.warehouse.complete_cycle_run(
            &summary.run_id,
            status.as_str(),
            &now_rfc3339(),
            summary.duration_ms as i64,
            &json,
        ) {
            tracing::error!(run = %summary.run_id, error = %e, "failed to record cycle result");
        }

        crate::metrics::inc_cycle(&self.name, status.as_str());
        crate::metrics::observe_cycle_duration(&self.name, summary.duration_ms as f64);
        tracing::info!(
            pipeline = %self.name,
            run = %summary.run_id,
            status = %status,
            tasks_succeeded = summary.ingestion.tasks_succeeded,
            tasks_failed = summary.ingestion.tasks_failed,
            rows_rejected = summary.rows_rejected().values().sum::<usize>(),
            rows_merged = summary.rows_merged(),
            halted = summary.halted.len(),
            duration_ms = summary.duration_ms,
            "cycle finished"
        );
    }

    /// Re-enrich every curated row, e.g. after a reference snapshot was replaced.
    pub async fn refresh_enrichment(&self) -> TransitFlowResult<Vec<EnrichmentReport>> {
        let _cycle = self.cycle_lock.lock().await;
        let mut reports = Vec::new();
        for (unit, curation) in &self.curations {
            let keys = self.warehouse.curated_key_set(unit)?;
            let joins = self.enrichment.get(unit).map(Vec::as_slice).unwrap_or(&[]);
            reports.push(self.resolver.resolve(unit, &curation.field_types(), joins, &keys)?);
        }
        Ok(reports)
    }
}
