use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use transitflow_utils::RowMap;

use super::record::{coerce, format_ts, identifier, parse_event_ts, CuratedRecord, Curation, Lineage, NaturalKey};
use crate::warehouse::StoredRawRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RejectReason {
    MissingLine,
    MissingStop,
    MissingTimestamp,
    BadTimestamp,
    FutureTimestamp,
    StaleTimestamp,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingLine => "missing_line",
            RejectReason::MissingStop => "missing_stop",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::BadTimestamp => "bad_timestamp",
            RejectReason::FutureTimestamp => "future_timestamp",
            RejectReason::StaleTimestamp => "stale_timestamp",
        }
    }
}

/// Rejected row counts by reason.
pub type Rejections = BTreeMap<String, usize>;

/// The sane window for event times, fixed for one merge cycle.
#[derive(Debug, Clone, Copy)]
pub struct TimeBounds {
    pub now: DateTime<Utc>,
    pub future_tolerance: Duration,
    pub max_age: Option<Duration>,
}

impl TimeBounds {
    fn check(&self, ts: &DateTime<Utc>) -> Result<(), RejectReason> {
        if *ts > self.now + self.future_tolerance {
            return Err(RejectReason::FutureTimestamp);
        }
        if let Some(max_age) = self.max_age {
            if *ts < self.now - max_age {
                return Err(RejectReason::StaleTimestamp);
            }
        }
        Ok(())
    }
}

/// Turn one raw row into a curated record, or say why it is rejected.
pub fn curate_row(curation: &Curation, raw: &StoredRawRow, bounds: &TimeBounds) -> Result<CuratedRecord, RejectReason> {
    let row: &RowMap = &raw.values;

    let line_id = match &curation.line {
        Some(column) => identifier(row, column).ok_or(RejectReason::MissingLine)?,
        None => String::new(),
    };
    let stop_id = match &curation.stop {
        Some(column) => identifier(row, column).ok_or(RejectReason::MissingStop)?,
        None => String::new(),
    };
    let vehicle_id = curation.vehicle.as_deref().and_then(|c| identifier(row, c)).unwrap_or_default();

    let raw_ts = row
        .get(&curation.timestamp)
        .filter(|v| !v.is_null())
        .ok_or(RejectReason::MissingTimestamp)?;
    let ts = parse_event_ts(raw_ts).ok_or(RejectReason::BadTimestamp)?;
    bounds.check(&ts)?;

    let mut fields = RowMap::new();
    for field in &curation.fields {
        let value = row.get(&field.column).map_or(serde_json::Value::Null, |v| coerce(field.field_type, v));
        fields.insert(field.name.clone(), value);
    }

    Ok(CuratedRecord {
        key: NaturalKey {
            source_id: curation.source_id.clone(),
            line_id,
            stop_id,
            vehicle_id,
            event_ts: format_ts(&ts),
        },
        fields,
        lineage: Lineage {
            source_ref: raw.source_ref.clone(),
            ingested_at: raw.ingested_at.clone(),
            run_id: raw.run_id.clone(),
            raw_row_id: raw.row_id,
        },
    })
}

/// VALIDATE: keep the rows that curate cleanly and count the rest.
pub fn validate(curation: &Curation, rows: &[StoredRawRow], bounds: &TimeBounds) -> (Vec<CuratedRecord>, Rejections) {
    let mut accepted = Vec::with_capacity(rows.len());
    let mut rejected = Rejections::new();
    for raw in rows {
        match curate_row(curation, raw, bounds) {
            Ok(record) => accepted.push(record),
            Err(reason) => *rejected.entry(reason.as_str().to_string()).or_default() += 1,
        }
    }
    (accepted, rejected)
}
