use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::Serialize;
use transitflow_utils::error::Error;
use transitflow_utils::TransitFlowResult;

use super::dedup::{dedup_within_batch, CycleSurvivors};
use super::record::{CuratedRecord, Curation, NaturalKey};
use super::validate::{validate, Rejections, TimeBounds};
use crate::config::types::TieBreak;
use crate::warehouse::curated::curated_table;
use crate::warehouse::{StoredRawRow, UpsertCounts, Warehouse};

/// Stages of one merge batch, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    ReadDelta,
    Validate,
    DedupWithinBatch,
    Merge,
    Commit,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePhase::ReadDelta => "READ_DELTA",
            MergePhase::Validate => "VALIDATE",
            MergePhase::DedupWithinBatch => "DEDUP_WITHIN_BATCH",
            MergePhase::Merge => "MERGE",
            MergePhase::Commit => "COMMIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub tie_break: TieBreak,
    pub future_tolerance: Duration,
    pub max_event_age: Option<Duration>,
    pub max_rows_per_batch: usize,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            future_tolerance: Duration::minutes(5),
            max_event_age: None,
            max_rows_per_batch: 50_000,
        }
    }
}

/// The pure part of a batch: what to upsert and what was dropped.
#[derive(Debug)]
pub struct MergePlan {
    pub records: Vec<CuratedRecord>,
    pub rejected: Rejections,
    pub collapsed: usize,
    /// Highest raw row id covered by this plan.
    pub watermark: i64,
}

/// VALIDATE then DEDUP_WITHIN_BATCH over one delta, without touching storage.
pub fn plan_batch(curation: &Curation, rows: &[StoredRawRow], bounds: &TimeBounds, tie_break: TieBreak) -> MergePlan {
    let watermark = rows.iter().map(|r| r.row_id).max().unwrap_or(0);
    let (accepted, rejected) = validate(curation, rows, bounds);
    let (records, collapsed) = dedup_within_batch(accepted, tie_break);
    MergePlan { records, rejected, collapsed, watermark }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub unit: String,
    pub batches: usize,
    pub rows_read: usize,
    pub rows_rejected: Rejections,
    pub rows_collapsed: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Keys written this cycle, for enrichment.
    #[serde(skip)]
    pub keys: Vec<NaturalKey>,
}

impl MergeReport {
    pub fn rejected_total(&self) -> usize {
        self.rows_rejected.values().sum()
    }
}

/// Curated tables currently being merged. One writer per table.
#[derive(Debug, Default)]
pub struct TableLocks {
    held: Mutex<HashSet<String>>,
}

pub struct TableGuard<'a> {
    locks: &'a TableLocks,
    table: String,
}

impl TableLocks {
    pub fn try_acquire(&self, table: &str) -> TransitFlowResult<TableGuard<'_>> {
        let mut held = self.held.lock().map_err(|_| Error::LockPoisoned)?;
        if !held.insert(table.to_string()) {
            return Err(Error::TableBusy(table.to_string()));
        }
        Ok(TableGuard { locks: self, table: table.to_string() })
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.table);
        }
    }
}

pub struct MergeEngine {
    warehouse: Arc<Warehouse>,
    locks: Arc<TableLocks>,
    settings: MergeSettings,
}

impl MergeEngine {
    pub fn new(warehouse: Arc<Warehouse>, locks: Arc<TableLocks>, settings: MergeSettings) -> Self {
        Self { warehouse, locks, settings }
    }

    /// Merge everything ingested since the watermark, one bounded batch at a time.
    ///
    /// Each batch commits atomically with its watermark; a crash between
    /// batches replays only the uncommitted one.
    pub fn run_cycle(&self, curation: &Curation) -> TransitFlowResult<MergeReport> {
        let table = curated_table(&curation.unit);
        let _guard = self.locks.try_acquire(&table)?;

        let fields = curation.field_types();
        let added = self.warehouse.ensure_curated_table(&curation.unit, &fields)?;
        if !added.is_empty() {
            tracing::info!(table = %table, columns = ?added, "curated columns added");
        }

        let mut report = MergeReport { unit: curation.unit.clone(), ..Default::default() };
        let bounds = TimeBounds {
            now: Utc::now(),
            future_tolerance: self.settings.future_tolerance,
            max_age: self.settings.max_event_age,
        };
        let mut watermark = self.warehouse.merge_watermark(&curation.unit)?;
        let mut survivors = CycleSurvivors::new();

        loop {
            tracing::debug!(table = %table, phase = %MergePhase::ReadDelta, after = watermark, "merge phase");
            let rows = self.warehouse.raw_rows_after(&curation.unit, watermark, self.settings.max_rows_per_batch)?;
            if rows.is_empty() {
                break;
            }

            let counts = self.merge_batch(curation, &rows, &bounds, &mut survivors, &mut report)?;
            watermark = rows.iter().map(|r| r.row_id).max().unwrap_or(watermark);
            report.inserted += counts.inserted;
            report.updated += counts.updated;

            if rows.len() < self.settings.max_rows_per_batch {
                break;
            }
        }

        report.keys = survivors.into_keys();

        for (reason, count) in &report.rows_rejected {
            crate::metrics::inc_rejected(&curation.unit, reason, *count as u64);
        }
        crate::metrics::inc_merged(&curation.unit, (report.inserted + report.updated) as u64);
        tracing::info!(
            table = %table,
            batches = report.batches,
            read = report.rows_read,
            rejected = report.rejected_total(),
            inserted = report.inserted,
            updated = report.updated,
            "merge cycle finished"
        );
        Ok(report)
    }

    /// Run one delta through VALIDATE, DEDUP_WITHIN_BATCH, MERGE and COMMIT.
    ///
    /// `survivors` carries the winners of earlier batches of the same cycle;
    /// records that lose to them are dropped as collapsed.
    pub fn merge_batch(
        &self,
        curation: &Curation,
        rows: &[StoredRawRow],
        bounds: &TimeBounds,
        survivors: &mut CycleSurvivors,
        report: &mut MergeReport,
    ) -> TransitFlowResult<UpsertCounts> {
        tracing::debug!(unit = %curation.unit, phase = %MergePhase::Validate, rows = rows.len(), "merge phase");
        let mut plan = plan_batch(curation, rows, bounds, self.settings.tie_break);
        let (records, superseded) = survivors.admit(plan.records, self.settings.tie_break);
        plan.records = records;
        plan.collapsed += superseded;
        tracing::debug!(
            unit = %curation.unit,
            phase = %MergePhase::DedupWithinBatch,
            kept = plan.records.len(),
            collapsed = plan.collapsed,
            "merge phase"
        );

        tracing::debug!(unit = %curation.unit, phase = %MergePhase::Merge, "merge phase");
        let field_names: Vec<String> = curation.fields.iter().map(|f| f.name.clone()).collect();
        let counts = self
            .warehouse
            .upsert_curated(&curation.unit, &field_names, &plan.records, plan.watermark)?;
        tracing::debug!(unit = %curation.unit, phase = %MergePhase::Commit, watermark = plan.watermark, "merge phase");

        report.batches += 1;
        report.rows_read += rows.len();
        report.rows_collapsed += plan.collapsed;
        for (reason, count) in plan.rejected {
            *report.rows_rejected.entry(reason).or_default() += count;
        }
        Ok(counts)
    }
}
