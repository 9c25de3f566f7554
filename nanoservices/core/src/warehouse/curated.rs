use std::collections::HashSet;

use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::Value;
use transitflow_utils::{RowMap, TransitFlowResult};

use super::{from_sql, now_rfc3339, quote_ident, table_columns, table_exists, to_sql, Warehouse};
use crate::config::types::FieldType;
use crate::enrich::EnrichedRow;
use crate::merge::record::{CuratedRecord, NaturalKey};

const KEY_COLUMNS: [&str; 5] = ["source_id", "line_id", "stop_id", "vehicle_id", "event_ts"];
const LINEAGE_COLUMNS: [&str; 4] = ["source_ref", "ingested_at", "run_id", "merged_at"];
const UNMATCHED_COLUMN: &str = "_unmatched";

/// Whether `name` clashes with a column the curated or enriched tables own.
/// SQLite compares column names without case, and so does this.
pub fn is_reserved_column(name: &str) -> bool {
    KEY_COLUMNS
        .iter()
        .chain(LINEAGE_COLUMNS.iter())
        .chain(std::iter::once(&UNMATCHED_COLUMN))
        .any(|c| c.eq_ignore_ascii_case(name))
}

pub fn curated_table(unit: &str) -> String {
    format!("curated_{unit}")
}

pub fn enriched_table(unit: &str) -> String {
    format!("enriched_{unit}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// A curated row read back, business fields and lineage in `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratedRow {
    pub key: NaturalKey,
    pub values: RowMap,
}

fn affinity(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Int | FieldType::Bool => "INTEGER",
        FieldType::Float => "REAL",
        FieldType::Text | FieldType::Timestamp => "TEXT",
    }
}

fn key_params(key: &NaturalKey) -> [&str; 5] {
    [&key.source_id, &key.line_id, &key.stop_id, &key.vehicle_id, &key.event_ts]
}

const KEY_PREDICATE: &str = "source_id = ?1 AND line_id = ?2 AND stop_id = ?3 AND vehicle_id = ?4 AND event_ts = ?5";

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NaturalKey> {
    Ok(NaturalKey {
        source_id: row.get("source_id")?,
        line_id: row.get("line_id")?,
        stop_id: row.get("stop_id")?,
        vehicle_id: row.get("vehicle_id")?,
        event_ts: row.get("event_ts")?,
    })
}

/// Create `table` keyed by the natural key, then add any missing columns.
fn ensure_keyed_table(tx: &Transaction<'_>, table: &str, extra: &[(String, &str)]) -> TransitFlowResult<Vec<String>> {
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            source_id TEXT NOT NULL,
            line_id TEXT NOT NULL,
            stop_id TEXT NOT NULL,
            vehicle_id TEXT NOT NULL DEFAULT '',
            event_ts TEXT NOT NULL,
            PRIMARY KEY (source_id, line_id, stop_id, vehicle_id, event_ts)
        )",
        quote_ident(table)
    ))?;
    let existing: HashSet<String> = table_columns(tx, table)?.into_iter().collect();
    let mut added = Vec::new();
    for (column, affinity) in extra {
        if !existing.contains(column) {
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(column),
                affinity
            ))?;
            added.push(column.clone());
        }
    }
    Ok(added)
}

impl Warehouse {
    /// Create `curated_<unit>` or add newly configured business fields as nullable columns.
    pub fn ensure_curated_table(&self, unit: &str, fields: &[(String, FieldType)]) -> TransitFlowResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut columns: Vec<(String, &str)> = fields.iter().map(|(n, t)| (n.clone(), affinity(*t))).collect();
        columns.extend(LINEAGE_COLUMNS.iter().map(|c| (c.to_string(), "TEXT")));
        let added = ensure_keyed_table(&tx, &curated_table(unit), &columns)?;
        tx.commit()?;
        Ok(added)
    }

    /// Last raw row id already merged into `curated_<unit>`.
    pub fn merge_watermark(&self, unit: &str) -> TransitFlowResult<i64> {
        let conn = self.lock()?;
        let watermark = conn
            .query_row("SELECT last_row_id FROM merge_watermarks WHERE unit = ?1", params![unit], |row| row.get(0))
            .optional()?;
        Ok(watermark.unwrap_or(0))
    }

    /// Upsert `records` by natural key and move the watermark, atomically.
    ///
    /// A key already present is overwritten in full: a later batch always
    /// supersedes an earlier one.
    pub fn upsert_curated(
        &self,
        unit: &str,
        fields: &[String],
        records: &[CuratedRecord],
        watermark: i64,
    ) -> TransitFlowResult<UpsertCounts> {
        let table = quote_ident(&curated_table(unit));
        let mut columns: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(fields.iter().cloned());
        columns.extend(LINEAGE_COLUMNS.iter().map(|c| c.to_string()));

        let updates = columns[KEY_COLUMNS.len()..]
            .iter()
            .map(|c| format!("{q} = excluded.{q}", q = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let upsert_sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT (source_id, line_id, stop_id, vehicle_id, event_ts) DO UPDATE SET {updates}",
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
        );
        let exists_sql = format!("SELECT 1 FROM {table} WHERE {KEY_PREDICATE}");

        let merged_at = now_rfc3339();
        let mut counts = UpsertCounts::default();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut exists = tx.prepare(&exists_sql)?;
            let mut upsert = tx.prepare(&upsert_sql)?;
            for record in records {
                if exists.exists(&key_params(&record.key))? {
                    counts.updated += 1;
                } else {
                    counts.inserted += 1;
                }
                let mut values: Vec<SqlValue> = key_params(&record.key).iter().map(|k| SqlValue::Text(k.to_string())).collect();
                values.extend(fields.iter().map(|f| record.fields.get(f).map_or(SqlValue::Null, to_sql)));
                values.push(SqlValue::Text(record.lineage.source_ref.clone()));
                values.push(SqlValue::Text(record.lineage.ingested_at.clone()));
                values.push(SqlValue::Text(record.lineage.run_id.clone()));
                values.push(SqlValue::Text(merged_at.clone()));
                upsert.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.execute(
            "INSERT INTO merge_watermarks (unit, last_row_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (unit) DO UPDATE SET last_row_id = excluded.last_row_id, updated_at = excluded.updated_at",
            params![unit, watermark, merged_at],
        )?;
        tx.commit()?;
        Ok(counts)
    }

    pub fn curated_row_count(&self, unit: &str) -> TransitFlowResult<usize> {
        let table = curated_table(unit);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(&table)), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every natural key in `curated_<unit>`, in key order.
    pub fn curated_key_set(&self, unit: &str) -> TransitFlowResult<Vec<NaturalKey>> {
        let table = curated_table(unit);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT source_id, line_id, stop_id, vehicle_id, event_ts FROM {} ORDER BY 1, 2, 3, 4, 5",
            quote_ident(&table)
        ))?;
        let keys = stmt.query_map([], key_from_row)?;
        Ok(keys.collect::<Result<Vec<_>, _>>()?)
    }

    /// Read curated rows for `keys`. Keys that are absent are skipped.
    pub fn curated_rows(&self, unit: &str, keys: &[NaturalKey], fields: &[(String, FieldType)]) -> TransitFlowResult<Vec<CuratedRow>> {
        let table = curated_table(unit);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE {KEY_PREDICATE}", quote_ident(&table)))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let found = stmt
                .query_row(&key_params(key), |row| {
                    let mut values = RowMap::new();
                    for (i, name) in names.iter().enumerate() {
                        if KEY_COLUMNS.contains(&name.as_str()) {
                            continue;
                        }
                        let mut value = from_sql(row.get_ref(i)?);
                        let is_bool = fields.iter().any(|(f, t)| f == name && *t == FieldType::Bool);
                        if let (true, Some(n)) = (is_bool, value.as_i64()) {
                            value = Value::Bool(n != 0);
                        }
                        values.insert(name.clone(), value);
                    }
                    Ok(CuratedRow { key: key_from_row(row)?, values })
                })
                .optional()?;
            rows.extend(found);
        }
        Ok(rows)
    }

    /// Upsert enriched rows into `enriched_<unit>`, adding columns as joins introduce them.
    pub fn upsert_enriched(&self, unit: &str, rows: &[EnrichedRow]) -> TransitFlowResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = enriched_table(unit);
        let mut value_columns: Vec<String> = Vec::new();
        for row in rows {
            for name in row.values.keys() {
                if !value_columns.contains(name) && !KEY_COLUMNS.contains(&name.as_str()) {
                    value_columns.push(name.clone());
                }
            }
        }
        let mut extra: Vec<(String, &str)> = value_columns.iter().map(|c| (c.clone(), "")).collect();
        extra.push((UNMATCHED_COLUMN.to_string(), "TEXT"));

        let mut columns: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(value_columns.iter().cloned());
        columns.push(UNMATCHED_COLUMN.to_string());
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(&table),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
        );

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_keyed_table(&tx, &table, &extra)?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                let mut values: Vec<SqlValue> = key_params(&row.key).iter().map(|k| SqlValue::Text(k.to_string())).collect();
                values.extend(value_columns.iter().map(|c| row.values.get(c).map_or(SqlValue::Null, to_sql)));
                values.push(if row.unmatched.is_empty() {
                    SqlValue::Null
                } else {
                    SqlValue::Text(row.unmatched.join(","))
                });
                stmt.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Full contents of `enriched_<unit>`, one map per row including key columns.
    pub fn enriched_rows(&self, unit: &str) -> TransitFlowResult<Vec<RowMap>> {
        let table = enriched_table(unit);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY 1, 2, 3, 4, 5", quote_ident(&table)))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let rows = stmt.query_map([], |row| {
            let mut values = RowMap::new();
            for (i, name) in names.iter().enumerate() {
                values.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            Ok(values)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
