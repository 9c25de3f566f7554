use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::record::{CuratedRecord, NaturalKey};
use crate::config::types::TieBreak;

/// DEDUP_WITHIN_BATCH: one record per natural key, chosen by `policy`.
///
/// Returns the survivors in key order and how many records were collapsed.
pub fn dedup_within_batch(records: Vec<CuratedRecord>, policy: TieBreak) -> (Vec<CuratedRecord>, usize) {
    let total = records.len();
    let mut survivors: BTreeMap<NaturalKey, CuratedRecord> = BTreeMap::new();
    for record in records {
        match survivors.get(&record.key) {
            Some(incumbent) if rank(incumbent, &record, policy) != Ordering::Less => {}
            _ => {
                survivors.insert(record.key.clone(), record);
            }
        }
    }
    let kept = survivors.len();
    (survivors.into_values().collect(), total - kept)
}

/// Records already written by earlier batches of the same merge cycle.
///
/// A later batch only overwrites a key when its record outranks the one an
/// earlier batch wrote, so the winner does not depend on the batch size.
#[derive(Debug, Default)]
pub struct CycleSurvivors {
    written: HashMap<NaturalKey, CuratedRecord>,
}

impl CycleSurvivors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the records that beat this cycle's incumbents. Also returns how
    /// many records met a key an earlier batch already wrote.
    pub fn admit(&mut self, records: Vec<CuratedRecord>, policy: TieBreak) -> (Vec<CuratedRecord>, usize) {
        let mut kept = Vec::with_capacity(records.len());
        let mut collapsed = 0;
        for record in records {
            if let Some(incumbent) = self.written.get(&record.key) {
                collapsed += 1;
                if rank(incumbent, &record, policy) != Ordering::Less {
                    continue;
                }
            }
            self.written.insert(record.key.clone(), record.clone());
            kept.push(record);
        }
        (kept, collapsed)
    }

    /// Every key written this cycle, in key order.
    pub fn into_keys(self) -> Vec<NaturalKey> {
        let mut keys: Vec<NaturalKey> = self.written.into_keys().collect();
        keys.sort();
        keys
    }
}

/// Order two observations of one key; the greater one wins.
fn rank(a: &CuratedRecord, b: &CuratedRecord, policy: TieBreak) -> Ordering {
    let by_ingestion = a.lineage.ingested_at.cmp(&b.lineage.ingested_at);
    let primary = match policy {
        TieBreak::LatestIngestion => by_ingestion,
        TieBreak::EarliestIngestion => by_ingestion.reverse(),
        TieBreak::MostComplete => a.non_null_fields().cmp(&b.non_null_fields()).then(by_ingestion),
    };
    primary.then(a.lineage.raw_row_id.cmp(&b.lineage.raw_row_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::record::Lineage;
    use serde_json::{json, Value};

    fn record(row_id: i64, ingested_at: &str, fields: Value) -> CuratedRecord {
        CuratedRecord {
            key: NaturalKey {
                source_id: "arrivals".into(),
                line_id: "L1".into(),
                stop_id: "S1".into(),
                vehicle_id: String::new(),
                event_ts: "2026-02-03T10:00:00.000Z".into(),
            },
            fields: fields.as_object().cloned().unwrap(),
            lineage: Lineage {
                source_ref: format!("f{row_id}"),
                ingested_at: ingested_at.into(),
                run_id: "run-1".into(),
                raw_row_id: row_id,
            },
        }
    }

    fn batch() -> Vec<CuratedRecord> {
        vec![
            record(1, "2026-02-03T10:01:00Z", json!({ "delay": 10, "status": "late" })),
            record(2, "2026-02-03T10:03:00Z", json!({ "delay": 30, "status": null })),
            record(3, "2026-02-03T10:02:00Z", json!({ "delay": 20, "status": "late" })),
        ]
    }

    #[test]
    fn latest_ingestion_wins_by_default() {
        let (kept, collapsed) = dedup_within_batch(batch(), TieBreak::default());
        assert_eq!(collapsed, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].fields["delay"], json!(30));
    }

    #[test]
    fn earliest_ingestion_policy() {
        let (kept, _) = dedup_within_batch(batch(), TieBreak::EarliestIngestion);
        assert_eq!(kept[0].lineage.raw_row_id, 1);
    }

    #[test]
    fn most_complete_prefers_non_null_then_latest() {
        let (kept, _) = dedup_within_batch(batch(), TieBreak::MostComplete);
        assert_eq!(kept[0].lineage.raw_row_id, 3);
    }

    #[test]
    fn later_batch_loses_to_earlier_winner_of_same_cycle() {
        let mut survivors = CycleSurvivors::new();
        let first = vec![record(1, "2026-02-03T10:01:00Z", json!({ "delay": 10 }))];
        let (kept, dropped) = survivors.admit(first, TieBreak::EarliestIngestion);
        assert_eq!((kept.len(), dropped), (1, 0));

        let second = vec![record(2, "2026-02-03T10:02:00Z", json!({ "delay": 20 }))];
        let (kept, collapsed) = survivors.admit(second.clone(), TieBreak::EarliestIngestion);
        assert!(kept.is_empty());
        assert_eq!(collapsed, 1);

        let (kept, collapsed) = survivors.admit(second, TieBreak::LatestIngestion);
        assert_eq!(kept[0].lineage.raw_row_id, 2);
        assert_eq!(collapsed, 1);
        assert_eq!(survivors.into_keys().len(), 1);
    }

    #[test]
    fn identical_ingestion_breaks_on_row_id() {
        let same = vec![
            record(9, "2026-02-03T10:00:00Z", json!({ "delay": 1 })),
            record(4, "2026-02-03T10:00:00Z", json!({ "delay": 2 })),
        ];
        let (kept, _) = dedup_within_batch(same.clone(), TieBreak::LatestIngestion);
        assert_eq!(kept[0].lineage.raw_row_id, 9);
        let (kept, _) = dedup_within_batch(same.into_iter().rev().collect(), TieBreak::EarliestIngestion);
        assert_eq!(kept[0].lineage.raw_row_id, 9);
    }
}
