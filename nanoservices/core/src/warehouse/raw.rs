use std::collections::HashSet;

use arrow::datatypes::DataType;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;
use transitflow_utils::{RowMap, TransitFlowResult};

use super::{from_sql, now_rfc3339, quote_ident, table_columns, table_exists, to_sql, Warehouse};
use crate::ingest::schema::{parse_type, sql_affinity, type_name};

/// Lineage columns present on every raw table, ahead of payload columns.
pub const LINEAGE_COLUMNS: [&str; 6] = ["_source_ref", "_item_index", "_ingested_at", "_run_id", "_unit", "_key"];

pub fn raw_table(unit: &str) -> String {
    format!("raw_{unit}")
}

/// One flattened payload item ready to append.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub source_ref: String,
    pub item_index: usize,
    pub ingested_at: String,
    pub run_id: String,
    pub key: Option<String>,
    pub values: RowMap,
}

/// Everything one ingest commit writes, applied in a single transaction.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub added: Vec<(String, DataType)>,
    pub upgraded: Vec<(String, DataType)>,
    pub rows: Vec<RawRow>,
    /// Landed files this batch consumes, with their row counts.
    pub checkpoints: Vec<(String, usize)>,
}

/// A raw row read back for merging.
#[derive(Debug, Clone)]
pub struct StoredRawRow {
    pub row_id: i64,
    pub source_ref: String,
    pub ingested_at: String,
    pub run_id: String,
    pub values: RowMap,
}

impl Warehouse {
    /// Column catalog of `raw_<unit>` in creation order.
    pub fn raw_schema(&self, unit: &str) -> TransitFlowResult<Vec<(String, DataType)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name, data_type FROM raw_columns WHERE unit = ?1 ORDER BY ordinal")?;
        let rows = stmt.query_map(params![unit], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut schema = Vec::new();
        for row in rows {
            let (name, data_type) = row?;
            schema.push((name, parse_type(&data_type)));
        }
        Ok(schema)
    }

    /// Landed files already committed for `unit`.
    pub fn consumed_refs(&self, unit: &str) -> TransitFlowResult<HashSet<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT source_ref FROM ingest_checkpoints WHERE unit = ?1")?;
        let refs = stmt.query_map(params![unit], |row| row.get::<_, String>(0))?;
        Ok(refs.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Apply schema changes, append rows and advance the checkpoint as one unit.
    ///
    /// Rows already present for a `(source_ref, item_index)` are ignored, so
    /// replaying a batch after a crash is harmless. Returns rows appended.
    pub fn commit_raw_batch(&self, unit: &str, batch: &RawBatch) -> TransitFlowResult<usize> {
        let table = raw_table(unit);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                _row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                _source_ref TEXT NOT NULL,
                _item_index INTEGER NOT NULL,
                _ingested_at TEXT NOT NULL,
                _run_id TEXT NOT NULL,
                _unit TEXT NOT NULL,
                _key TEXT,
                UNIQUE (_source_ref, _item_index)
            );",
            t = quote_ident(&table)
        ))?;

        let existing: HashSet<String> = table_columns(&tx, &table)?.into_iter().collect();
        let mut next_ordinal: i64 = tx
            .query_row("SELECT MAX(ordinal) FROM raw_columns WHERE unit = ?1", params![unit], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten()
            .map_or(0, |max| max + 1);

        for (name, data_type) in &batch.added {
            if !existing.contains(name) {
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(&table),
                    quote_ident(name),
                    sql_affinity(data_type)
                ))?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO raw_columns (unit, name, data_type, ordinal) VALUES (?1, ?2, ?3, ?4)",
                params![unit, name, type_name(data_type), next_ordinal],
            )?;
            next_ordinal += 1;
        }
        for (name, data_type) in &batch.upgraded {
            tx.execute(
                "UPDATE raw_columns SET data_type = ?3 WHERE unit = ?1 AND name = ?2",
                params![unit, name, type_name(data_type)],
            )?;
        }

        let mut appended = 0;
        for row in &batch.rows {
            let mut columns: Vec<String> = LINEAGE_COLUMNS.iter().map(|c| quote_ident(c)).collect();
            let mut values = vec![
                to_sql(&Value::from(row.source_ref.clone())),
                to_sql(&Value::from(row.item_index as i64)),
                to_sql(&Value::from(row.ingested_at.clone())),
                to_sql(&Value::from(row.run_id.clone())),
                to_sql(&Value::from(unit)),
                row.key.as_ref().map_or(rusqlite::types::Value::Null, |k| to_sql(&Value::from(k.clone()))),
            ];
            for (name, value) in &row.values {
                columns.push(quote_ident(name));
                values.push(to_sql(value));
            }
            let placeholders = (1..=values.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                columns.join(", "),
                placeholders
            );
            appended += tx.execute(&sql, params_from_iter(values.iter()))?;
        }

        let committed_at = now_rfc3339();
        for (source_ref, rows) in &batch.checkpoints {
            tx.execute(
                "INSERT OR IGNORE INTO ingest_checkpoints (unit, source_ref, rows, committed_at) VALUES (?1, ?2, ?3, ?4)",
                params![unit, source_ref, *rows as i64, committed_at],
            )?;
        }

        tx.commit()?;
        Ok(appended)
    }

    /// Raw rows with `_row_id > after`, oldest first, at most `limit`.
    pub fn raw_rows_after(&self, unit: &str, after: i64, limit: usize) -> TransitFlowResult<Vec<StoredRawRow>> {
        let table = raw_table(unit);
        let schema = self.raw_schema(unit)?;
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE _row_id > ?1 ORDER BY _row_id LIMIT ?2",
            quote_ident(&table)
        ))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let booleans: HashSet<&str> = schema
            .iter()
            .filter(|(_, t)| *t == DataType::Boolean)
            .map(|(n, _)| n.as_str())
            .collect();

        let rows = stmt.query_map(params![after, limit as i64], |row| {
            let mut stored = StoredRawRow {
                row_id: 0,
                source_ref: String::new(),
                ingested_at: String::new(),
                run_id: String::new(),
                values: RowMap::new(),
            };
            for (i, name) in names.iter().enumerate() {
                match name.as_str() {
                    "_row_id" => stored.row_id = row.get(i)?,
                    "_source_ref" => stored.source_ref = row.get(i)?,
                    "_ingested_at" => stored.ingested_at = row.get(i)?,
                    "_run_id" => stored.run_id = row.get(i)?,
                    "_item_index" | "_unit" | "_key" => {}
                    column => {
                        let mut value = from_sql(row.get_ref(i)?);
                        if booleans.contains(column) {
                            if let Some(n) = value.as_i64() {
                                value = Value::Bool(n != 0);
                            }
                        }
                        stored.values.insert(column.to_string(), value);
                    }
                }
            }
            Ok(stored)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn raw_row_count(&self, unit: &str) -> TransitFlowResult<usize> {
        let table = raw_table(unit);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(&table)), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
