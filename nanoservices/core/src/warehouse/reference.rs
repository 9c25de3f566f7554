use std::collections::{BTreeSet, HashMap};

use rusqlite::params;
use serde_json::Value;
use transitflow_utils::{RowMap, TransitFlowResult};

use super::{from_sql, now_rfc3339, quote_ident, table_exists, Warehouse};
use crate::aggregate::MetricRow;

pub fn reference_table(name: &str) -> String {
    format!("ref_{name}")
}

pub fn metric_table(name: &str) -> String {
    format!("metric_{name}")
}

/// Reference keys and join values compare as text.
pub(crate) fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Warehouse {
    /// Replace the snapshot of reference table `name` in one transaction.
    ///
    /// Rows without a usable `key_attribute` are skipped. Returns rows loaded.
    pub fn replace_reference(&self, name: &str, key_attribute: &str, rows: &[Value]) -> TransitFlowResult<usize> {
        let table = quote_ident(&reference_table(name));
        let loaded_at = now_rfc3339();
        let mut loaded = 0;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                attributes TEXT NOT NULL,
                loaded_at TEXT NOT NULL
            );
            DELETE FROM {table};"
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {table} (key, attributes, loaded_at) VALUES (?1, ?2, ?3)"
            ))?;
            for row in rows {
                let Some(key) = row.get(key_attribute).and_then(key_text) else {
                    tracing::warn!(reference = %name, attribute = %key_attribute, "reference row without key skipped");
                    continue;
                };
                stmt.execute(params![key, row.to_string(), loaded_at])?;
                loaded += 1;
            }
        }
        tx.commit()?;
        tracing::info!(reference = %name, rows = loaded, "reference snapshot replaced");
        Ok(loaded)
    }

    /// Latest committed snapshot of `name`, keyed by reference key. Empty when never loaded.
    pub fn reference_snapshot(&self, name: &str) -> TransitFlowResult<HashMap<String, RowMap>> {
        let table = reference_table(name);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(HashMap::new());
        }
        let mut stmt = conn.prepare(&format!("SELECT key, attributes FROM {}", quote_ident(&table)))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut snapshot = HashMap::new();
        for row in rows {
            let (key, attributes) = row?;
            if let Value::Object(map) = serde_json::from_str::<Value>(&attributes)? {
                snapshot.insert(key, map);
            }
        }
        Ok(snapshot)
    }

    /// Distinct non-empty values of one attribute across a reference snapshot, sorted.
    pub fn reference_values(&self, name: &str, attribute: &str) -> TransitFlowResult<Vec<String>> {
        let values: BTreeSet<String> = self
            .reference_snapshot(name)?
            .values()
            .filter_map(|attrs| attrs.get(attribute).and_then(key_text))
            .collect();
        Ok(values.into_iter().collect())
    }

    /// Replace the contents of `metric_<name>` in one transaction.
    pub fn replace_metric(&self, name: &str, rows: &[MetricRow]) -> TransitFlowResult<usize> {
        let table = quote_ident(&metric_table(name));
        let computed_at = now_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                dimension TEXT,
                value REAL NOT NULL,
                computed_at TEXT NOT NULL
            );
            DELETE FROM {table};"
        ))?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {table} (dimension, value, computed_at) VALUES (?1, ?2, ?3)"))?;
            for row in rows {
                stmt.execute(params![row.dimension, row.value, computed_at])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn metric_rows(&self, name: &str) -> TransitFlowResult<Vec<MetricRow>> {
        let table = metric_table(name);
        let conn = self.lock()?;
        if !table_exists(&conn, &table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT dimension, value FROM {} ORDER BY dimension",
            quote_ident(&table)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(MetricRow {
                dimension: match from_sql(row.get_ref(0)?) {
                    Value::String(s) => Some(s),
                    _ => None,
                },
                value: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
