use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use transitflow_utils::{RowMap, TransitFlowResult};

use crate::config::types::{FieldType, JoinConfig};
use crate::merge::record::NaturalKey;
use crate::warehouse::reference::key_text;
use crate::warehouse::{CuratedRow, Warehouse};

/// A curated row with reference attributes attached.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRow {
    pub key: NaturalKey,
    pub values: RowMap,
    /// References that had no row for this event.
    pub unmatched: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub unit: String,
    pub rows_enriched: usize,
    pub rows_unmatched: usize,
}

/// Reference snapshots keyed by reference name, then by reference key.
pub type Snapshots = HashMap<String, HashMap<String, RowMap>>;

/// Apply `joins` in order. Every input row comes out; misses get nulls.
pub fn enrich_rows(rows: Vec<CuratedRow>, joins: &[JoinConfig], snapshots: &Snapshots) -> Vec<EnrichedRow> {
    rows.into_iter()
        .map(|row| {
            let mut values = RowMap::new();
            values.insert("source_id".into(), Value::from(row.key.source_id.clone()));
            values.insert("line_id".into(), Value::from(row.key.line_id.clone()));
            values.insert("stop_id".into(), Value::from(row.key.stop_id.clone()));
            values.insert("vehicle_id".into(), Value::from(row.key.vehicle_id.clone()));
            values.insert("event_ts".into(), Value::from(row.key.event_ts.clone()));
            values.extend(row.values);

            let mut unmatched = Vec::new();
            for join in joins {
                let prefix = join.column_prefix();
                let matched = values
                    .get(&join.on)
                    .and_then(key_text)
                    .and_then(|k| snapshots.get(&join.reference)?.get(&k));
                if matched.is_none() {
                    unmatched.push(join.reference.clone());
                }
                for field in &join.fields {
                    let value = matched.and_then(|attrs| attrs.get(field)).cloned().unwrap_or(Value::Null);
                    values.insert(format!("{prefix}{field}"), value);
                }
            }
            EnrichedRow { key: row.key, values, unmatched }
        })
        .collect()
}

/// Joins curated rows against the latest reference snapshots.
pub struct EnrichmentResolver {
    warehouse: Arc<Warehouse>,
}

impl EnrichmentResolver {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Enrich the curated rows of `unit` identified by `keys` and upsert them.
    pub fn resolve(
        &self,
        unit: &str,
        fields: &[(String, FieldType)],
        joins: &[JoinConfig],
        keys: &[NaturalKey],
    ) -> TransitFlowResult<EnrichmentReport> {
        let mut report = EnrichmentReport { unit: unit.to_string(), ..Default::default() };
        if keys.is_empty() {
            return Ok(report);
        }

        let mut snapshots = Snapshots::new();
        for join in joins {
            if !snapshots.contains_key(&join.reference) {
                snapshots.insert(join.reference.clone(), self.warehouse.reference_snapshot(&join.reference)?);
            }
        }

        let rows = self.warehouse.curated_rows(unit, keys, fields)?;
        let enriched = enrich_rows(rows, joins, &snapshots);
        report.rows_enriched = self.warehouse.upsert_enriched(unit, &enriched)?;
        report.rows_unmatched = enriched.iter().filter(|r| !r.unmatched.is_empty()).count();

        if report.rows_unmatched > 0 {
            tracing::warn!(unit = %unit, unmatched = report.rows_unmatched, "events without reference match kept");
        }
        tracing::info!(unit = %unit, rows = report.rows_enriched, "enrichment finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn curated(stop: &str) -> CuratedRow {
        CuratedRow {
            key: NaturalKey {
                source_id: "arrivals".into(),
                line_id: "L1".into(),
                stop_id: stop.into(),
                vehicle_id: String::new(),
                event_ts: "2026-02-03T10:00:00.000Z".into(),
            },
            values: json!({ "delay": 30 }).as_object().cloned().unwrap(),
        }
    }

    fn joins() -> Vec<JoinConfig> {
        vec![
            JoinConfig { reference: "stops".into(), on: "stop_id".into(), prefix: None, fields: vec!["name".into(), "region".into()] },
            JoinConfig { reference: "regions".into(), on: "stops_region".into(), prefix: Some("region_".into()), fields: vec!["label".into()] },
        ]
    }

    fn snapshots() -> Snapshots {
        let mut stops = HashMap::new();
        stops.insert("S1".to_string(), json!({ "name": "Central", "region": "R1" }).as_object().cloned().unwrap());
        stops.insert("S2".to_string(), json!({ "name": "Harbour", "region": "R9" }).as_object().cloned().unwrap());
        let mut regions = HashMap::new();
        regions.insert("R1".to_string(), json!({ "label": "North" }).as_object().cloned().unwrap());
        let mut snapshots = Snapshots::new();
        snapshots.insert("stops".into(), stops);
        snapshots.insert("regions".into(), regions);
        snapshots
    }

    #[test]
    fn chained_joins_resolve_in_order() {
        let rows = enrich_rows(vec![curated("S1")], &joins(), &snapshots());
        assert_eq!(rows[0].values["stops_name"], json!("Central"));
        assert_eq!(rows[0].values["region_label"], json!("North"));
        assert_eq!(rows[0].values["delay"], json!(30));
        assert!(rows[0].unmatched.is_empty());
    }

    #[test]
    fn unmatched_rows_are_kept_and_flagged() {
        let rows = enrich_rows(vec![curated("S2"), curated("S404")], &joins(), &snapshots());
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].values["stops_name"], json!("Harbour"));
        assert_eq!(rows[0].values["region_label"], Value::Null);
        assert_eq!(rows[0].unmatched, vec!["regions"]);

        assert_eq!(rows[1].values["stops_name"], Value::Null);
        assert_eq!(rows[1].unmatched, vec!["stops", "regions"]);
    }

    #[test]
    fn resolver_writes_enriched_table() {
        let warehouse = Arc::new(Warehouse::in_memory().unwrap());
        warehouse
            .replace_reference("stops", "stop_id", &[json!({ "stop_id": "S1", "name": "Central", "region": "R1" })])
            .unwrap();
        let fields = vec![("delay".to_string(), FieldType::Int)];
        warehouse.ensure_curated_table("arrivals", &fields).unwrap();
        let record = crate::merge::record::CuratedRecord {
            key: curated("S1").key,
            fields: json!({ "delay": 30 }).as_object().cloned().unwrap(),
            lineage: crate::merge::record::Lineage {
                source_ref: "f".into(),
                ingested_at: "t".into(),
                run_id: "r".into(),
                raw_row_id: 1,
            },
        };
        warehouse.upsert_curated("arrivals", &["delay".to_string()], &[record.clone()], 1).unwrap();

        let resolver = EnrichmentResolver::new(warehouse.clone());
        let report = resolver.resolve("arrivals", &fields, &joins(), &[record.key]).unwrap();
        assert_eq!(report.rows_enriched, 1);
        assert_eq!(report.rows_unmatched, 1);

        let rows = warehouse.enriched_rows("arrivals").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["stops_name"], json!("Central"));
        assert_eq!(rows[0]["_unmatched"], json!("regions"));
    }
}
