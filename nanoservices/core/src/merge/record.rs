//! The curated record contract: natural key, typed business fields, lineage.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use transitflow_utils::RowMap;

use crate::config::types::{CurationConfig, FieldType};

/// Identifies one real-world event across replays, late arrivals and corrections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NaturalKey {
    pub source_id: String,
    pub line_id: String,
    pub stop_id: String,
    pub vehicle_id: String,
    /// UTC, RFC3339 with millisecond precision.
    pub event_ts: String,
}

/// Where a curated row came from. Not part of the key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    pub source_ref: String,
    pub ingested_at: String,
    pub run_id: String,
    pub raw_row_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CuratedRecord {
    pub key: NaturalKey,
    pub fields: RowMap,
    pub lineage: Lineage,
}

impl CuratedRecord {
    pub fn non_null_fields(&self) -> usize {
        self.fields.values().filter(|v| !v.is_null()).count()
    }
}

#[derive(Debug, Clone)]
pub struct CuratedField {
    pub name: String,
    pub column: String,
    pub field_type: FieldType,
}

/// How one unit's raw columns map onto the curated contract.
#[derive(Debug, Clone)]
pub struct Curation {
    pub unit: String,
    pub source_id: String,
    pub line: Option<String>,
    pub stop: Option<String>,
    pub vehicle: Option<String>,
    pub timestamp: String,
    pub fields: Vec<CuratedField>,
}

impl Curation {
    pub fn from_config(unit: &str, source_id: &str, config: &CurationConfig) -> Self {
        Self {
            unit: unit.to_string(),
            source_id: source_id.to_string(),
            line: config.line.clone(),
            stop: config.stop.clone(),
            vehicle: config.vehicle.clone(),
            timestamp: config.timestamp.clone(),
            fields: config
                .fields
                .iter()
                .map(|f| CuratedField {
                    name: f.name.clone(),
                    column: f.column.clone().unwrap_or_else(|| f.name.clone()),
                    field_type: f.field_type,
                })
                .collect(),
        }
    }

    pub fn field_types(&self) -> Vec<(String, FieldType)> {
        self.fields.iter().map(|f| (f.name.clone(), f.field_type)).collect()
    }
}

/// Read an identifier column. Numbers are accepted; blanks count as missing.
pub fn identifier(row: &RowMap, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an event time: RFC3339, naive ISO (taken as UTC) or epoch seconds/milliseconds.
pub fn parse_event_ts(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    // Anything past year 5138 in seconds is read as milliseconds.
    if raw.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Coerce a raw value to a business type. Values that do not fit become null.
pub fn coerce(field_type: FieldType, value: &Value) -> Value {
    match (field_type, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::Int, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map_or(Value::Null, Value::from),
        (FieldType::Int, Value::String(s)) => s.trim().parse::<i64>().map_or(Value::Null, Value::from),
        (FieldType::Float, Value::Number(n)) => n.as_f64().map_or(Value::Null, Value::from),
        (FieldType::Float, Value::String(s)) => s.trim().parse::<f64>().map_or(Value::Null, Value::from),
        (FieldType::Text, Value::String(s)) => Value::String(s.clone()),
        (FieldType::Text, other) => Value::String(other.to_string()),
        (FieldType::Bool, Value::Bool(b)) => Value::Bool(*b),
        (FieldType::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => Value::Null,
        },
        (FieldType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::Null,
        },
        (FieldType::Timestamp, v) => parse_event_ts(v).map_or(Value::Null, |ts| Value::String(format_ts(&ts))),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_normalize_to_utc_millis() {
        let expected = "2026-02-03T10:15:00.000Z";
        for raw in [
            json!("2026-02-03T11:15:00+01:00"),
            json!("2026-02-03T10:15:00Z"),
            json!("2026-02-03 10:15:00"),
            json!(1_770_113_700),
            json!(1_770_113_700_000i64),
        ] {
            let ts = parse_event_ts(&raw).unwrap_or_else(|| panic!("unparsed {raw}"));
            assert_eq!(format_ts(&ts), expected, "for {raw}");
        }
        assert!(parse_event_ts(&json!("yesterday")).is_none());
        assert!(parse_event_ts(&json!(true)).is_none());
    }

    #[test]
    fn coercion_is_lenient_but_typed() {
        assert_eq!(coerce(FieldType::Int, &json!("42")), json!(42));
        assert_eq!(coerce(FieldType::Int, &json!(3.0)), json!(3));
        assert_eq!(coerce(FieldType::Int, &json!(3.5)), Value::Null);
        assert_eq!(coerce(FieldType::Float, &json!(2)), json!(2.0));
        assert_eq!(coerce(FieldType::Text, &json!(7)), json!("7"));
        assert_eq!(coerce(FieldType::Bool, &json!(1)), json!(true));
        assert_eq!(coerce(FieldType::Bool, &json!("no")), json!(false));
        assert_eq!(coerce(FieldType::Bool, &json!("maybe")), Value::Null);
        assert_eq!(coerce(FieldType::Timestamp, &json!("2026-02-03T10:15:00Z")), json!("2026-02-03T10:15:00.000Z"));
    }

    #[test]
    fn identifiers_accept_numbers_and_reject_blanks() {
        let row = json!({ "line": 12, "stop": "  ", "vehicle": " V9 " });
        let row = row.as_object().unwrap();
        assert_eq!(identifier(row, "line").as_deref(), Some("12"));
        assert_eq!(identifier(row, "stop"), None);
        assert_eq!(identifier(row, "vehicle").as_deref(), Some("V9"));
        assert_eq!(identifier(row, "missing"), None);
    }
}
