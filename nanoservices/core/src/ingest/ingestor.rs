use std::sync::Arc;

use arrow::datatypes::DataType;
use serde::Serialize;
use serde_json::Value;
use transitflow_utils::error::Error;
use transitflow_utils::TransitFlowResult;

use super::schema::{evolve, flatten_item, infer_schema};
use crate::catalog::IngestionUnit;
use crate::landing::{RawLanding, SourceRef};
use crate::warehouse::raw::{raw_table, RawBatch, RawRow};
use crate::warehouse::Warehouse;

/// Outcome of one discovery pass over a unit's landing path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub unit: String,
    pub files_consumed: usize,
    pub rows_appended: usize,
    pub columns_added: Vec<String>,
    /// Files still waiting after the per-cycle cap.
    pub files_deferred: usize,
    /// Set when a payload could not be ingested. Later files wait for an operator.
    pub structural: Option<String>,
}

/// Moves landed records into `raw_<unit>`, evolving its columns as payloads change.
pub struct SchemaEvolvingIngestor {
    landing: Arc<dyn RawLanding>,
    warehouse: Arc<Warehouse>,
    max_files_per_cycle: usize,
}

struct Staged {
    batch: RawBatch,
    schema: Vec<(String, DataType)>,
}

impl SchemaEvolvingIngestor {
    pub fn new(landing: Arc<dyn RawLanding>, warehouse: Arc<Warehouse>, max_files_per_cycle: usize) -> Self {
        Self { landing, warehouse, max_files_per_cycle: max_files_per_cycle.max(1) }
    }

    /// Ingest the oldest unconsumed files of `unit`, up to the per-cycle cap.
    ///
    /// Files are staged in landing order. The first one that is unreadable or
    /// carries an incompatible type stops staging; everything before it is
    /// committed together with its checkpoint rows.
    pub async fn ingest_unit(&self, unit: &IngestionUnit) -> TransitFlowResult<IngestReport> {
        let mut report = IngestReport { unit: unit.name.clone(), ..Default::default() };

        let consumed = self.warehouse.consumed_refs(&unit.name)?;
        let pending: Vec<SourceRef> = self
            .landing
            .list(&unit.landing_path)
            .await?
            .into_iter()
            .filter(|r| !consumed.contains(r.as_str()))
            .collect();
        report.files_deferred = pending.len().saturating_sub(self.max_files_per_cycle);

        let mut staged = Staged { batch: RawBatch::default(), schema: self.warehouse.raw_schema(&unit.name)? };
        for source_ref in pending.into_iter().take(self.max_files_per_cycle) {
            if let Err(e) = self.stage_file(unit, &source_ref, &mut staged).await {
                tracing::error!(unit = %unit.name, source = %source_ref, error = %e, "raw ingestion halted");
                report.structural = Some(e.to_string());
                break;
            }
        }

        if staged.batch.checkpoints.is_empty() {
            return Ok(report);
        }

        report.files_consumed = staged.batch.checkpoints.len();
        report.columns_added = staged.batch.added.iter().map(|(n, _)| n.clone()).collect();
        report.rows_appended = self.warehouse.commit_raw_batch(&unit.name, &staged.batch)?;

        crate::metrics::inc_raw_rows(&unit.name, report.rows_appended as u64);
        if !report.columns_added.is_empty() {
            tracing::info!(unit = %unit.name, columns = ?report.columns_added, "raw schema evolved");
        }
        tracing::info!(
            unit = %unit.name,
            files = report.files_consumed,
            rows = report.rows_appended,
            deferred = report.files_deferred,
            "raw batch committed"
        );
        Ok(report)
    }

    async fn stage_file(&self, unit: &IngestionUnit, source_ref: &SourceRef, staged: &mut Staged) -> TransitFlowResult<()> {
        let table = raw_table(&unit.name);
        let landed = self.landing.read(source_ref).await?;

        if landed.header.unit != unit.name {
            // Shared landing path; another unit owns this file.
            staged.batch.checkpoints.push((source_ref.0.clone(), 0));
            return Ok(());
        }

        let body: Value = serde_json::from_slice(&landed.payload)
            .map_err(|e| Error::structural(&table, format!("{source_ref}: corrupted payload: {e}")))?;
        let items = unit
            .items(&body)
            .ok_or_else(|| Error::structural(&table, format!("{source_ref}: no item array at '{}'", unit.items_path)))?;

        let rows = items
            .iter()
            .map(flatten_item)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::structural(&table, format!("{source_ref}: {e}")))?;
        let schema = infer_schema(&rows).map_err(|e| Error::structural(&table, format!("{source_ref}: {e}")))?;
        let evolution = evolve(&table, &staged.schema, &schema).map_err(|e| Error::structural(&table, e.to_string()))?;
        if !evolution.is_empty() {
            tracing::debug!(
                table = %table,
                source = %source_ref,
                added = evolution.added.len(),
                upgraded = evolution.upgraded.len(),
                "raw schema evolved"
            );
        }

        for (name, data_type) in &evolution.upgraded {
            if let Some(slot) = staged.schema.iter_mut().find(|(n, _)| n == name) {
                slot.1 = data_type.clone();
            }
            // A column added earlier in this batch is still just an addition.
            if let Some(slot) = staged.batch.added.iter_mut().find(|(n, _)| n == name) {
                slot.1 = data_type.clone();
            } else {
                staged.batch.upgraded.push((name.clone(), data_type.clone()));
            }
        }
        staged.schema.extend(evolution.added.iter().cloned());
        staged.batch.added.extend(evolution.added);

        let row_count = rows.len();
        for (item_index, values) in rows.into_iter().enumerate() {
            staged.batch.rows.push(RawRow {
                source_ref: source_ref.0.clone(),
                item_index,
                ingested_at: landed.header.ingested_at.clone(),
                run_id: landed.header.run_id.clone(),
                key: landed.header.key.clone(),
                values,
            });
        }
        staged.batch.checkpoints.push((source_ref.0.clone(), row_count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_pipeline;
    use crate::landing::{FileLanding, RawRecord};
    use chrono::Utc;
    use serde_json::json;

    fn unit() -> IngestionUnit {
        let config = parse_pipeline(
            r#"
pipeline: p
units:
  arrivals:
    endpoint: "https://api.example/arrivals"
    items_path: data
"#,
        )
        .unwrap();
        IngestionUnit::from_config("arrivals", &config.units["arrivals"]).unwrap()
    }

    async fn land(landing: &FileLanding, page: u64, payload: Value) {
        landing
            .append(RawRecord {
                unit: "arrivals".into(),
                landing_path: "arrivals".into(),
                key: None,
                page,
                run_id: "run-1".into(),
                ingested_at: Utc::now(),
                payload: payload.to_string().into_bytes(),
            })
            .await
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, Arc<FileLanding>, Arc<Warehouse>) {
        let dir = tempfile::tempdir().unwrap();
        let landing = Arc::new(FileLanding::new(dir.path()));
        (dir, landing, Arc::new(Warehouse::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn rerun_does_not_reprocess() {
        let (_dir, landing, warehouse) = setup();
        land(&landing, 1, json!({ "data": [{ "stop_id": "S1" }, { "stop_id": "S2" }] })).await;

        let ingestor = SchemaEvolvingIngestor::new(landing.clone(), warehouse.clone(), 100);
        let first = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(first.files_consumed, 1);
        assert_eq!(first.rows_appended, 2);

        let second = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(second.files_consumed, 0);
        assert_eq!(warehouse.raw_row_count("arrivals").unwrap(), 2);

        land(&landing, 2, json!({ "data": [{ "stop_id": "S3" }] })).await;
        let third = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(third.rows_appended, 1);
    }

    #[tokio::test]
    async fn new_field_adds_nullable_column() {
        let (_dir, landing, warehouse) = setup();
        let ingestor = SchemaEvolvingIngestor::new(landing.clone(), warehouse.clone(), 100);

        land(&landing, 1, json!({ "data": [{ "stop_id": "S1", "delay": 10 }] })).await;
        ingestor.ingest_unit(&unit()).await.unwrap();
        land(&landing, 2, json!({ "data": [{ "stop_id": "S2", "delay": 20, "platform": "4" }] })).await;
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(report.columns_added, vec!["platform"]);

        let rows = warehouse.raw_rows_after("arrivals", 0, 10).unwrap();
        assert_eq!(rows[0].values["stop_id"], json!("S1"));
        assert_eq!(rows[0].values["delay"], json!(10));
        assert_eq!(rows[0].values["platform"], Value::Null);
        assert_eq!(rows[1].values["platform"], json!("4"));
    }

    #[tokio::test]
    async fn conflict_commits_prefix_and_halts() {
        let (_dir, landing, warehouse) = setup();
        land(&landing, 1, json!({ "data": [{ "delay": 10 }] })).await;
        land(&landing, 2, json!({ "data": [{ "delay": "late" }] })).await;
        land(&landing, 3, json!({ "data": [{ "delay": 30 }] })).await;

        let ingestor = SchemaEvolvingIngestor::new(landing.clone(), warehouse.clone(), 100);
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(report.files_consumed, 1);
        assert!(report.structural.as_deref().unwrap().contains("delay"));
        assert_eq!(warehouse.raw_row_count("arrivals").unwrap(), 1);

        // Still halted on the next pass.
        let again = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(again.files_consumed, 0);
        assert!(again.structural.is_some());
    }

    #[tokio::test]
    async fn case_only_rename_halts_after_committing_prefix() {
        let (_dir, landing, warehouse) = setup();
        land(&landing, 1, json!({ "data": [{ "stopId": "S1" }] })).await;
        land(&landing, 2, json!({ "data": [{ "stopid": "S2" }] })).await;

        let ingestor = SchemaEvolvingIngestor::new(landing.clone(), warehouse.clone(), 100);
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(report.files_consumed, 1);
        assert!(report.structural.as_deref().unwrap().contains("only by case"));
        assert_eq!(warehouse.raw_row_count("arrivals").unwrap(), 1);
    }

    #[tokio::test]
    async fn flattening_collision_is_structural() {
        let (_dir, landing, warehouse) = setup();
        land(&landing, 1, json!({ "data": [{ "stop": { "id": "S1" }, "stop_id": "S2" }] })).await;

        let ingestor = SchemaEvolvingIngestor::new(landing, warehouse.clone(), 100);
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(report.files_consumed, 0);
        assert!(report.structural.as_deref().unwrap().contains("stop_id"));
        assert_eq!(warehouse.raw_row_count("arrivals").unwrap(), 0);
    }

    #[tokio::test]
    async fn cap_defers_remaining_files() {
        let (_dir, landing, warehouse) = setup();
        for page in 1..=3 {
            land(&landing, page, json!({ "data": [{ "n": page }] })).await;
        }
        let ingestor = SchemaEvolvingIngestor::new(landing.clone(), warehouse.clone(), 2);
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(report.files_consumed, 2);
        assert_eq!(report.files_deferred, 1);

        let rest = ingestor.ingest_unit(&unit()).await.unwrap();
        assert_eq!(rest.files_consumed, 1);
        assert_eq!(warehouse.raw_row_count("arrivals").unwrap(), 3);
    }

    #[tokio::test]
    async fn corrupted_payload_is_structural() {
        let (dir, landing, warehouse) = setup();
        std::fs::create_dir_all(dir.path().join("arrivals")).unwrap();
        std::fs::write(
            dir.path().join("arrivals/0_broken.json"),
            b"{\"unit\":\"arrivals\",\"key\":null,\"page\":1,\"run_id\":\"r\",\"ingested_at\":\"t\"}\n{not json",
        )
        .unwrap();

        let ingestor = SchemaEvolvingIngestor::new(landing, warehouse, 10);
        let report = ingestor.ingest_unit(&unit()).await.unwrap();
        assert!(report.structural.unwrap().contains("corrupted payload"));
    }
}
