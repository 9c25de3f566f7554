//! SQLite-backed table storage.
//!
//! One `Warehouse` owns a single connection behind a mutex. Every operation
//! that touches more than one row or table runs inside one transaction, so a
//! crash leaves either the old or the new state and never a mix.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::Value;
use transitflow_utils::error::Error;
use transitflow_utils::TransitFlowResult;

pub mod curated;
pub mod raw;
pub mod reference;
pub mod runs;

pub use curated::{CuratedRow, UpsertCounts};
pub use raw::{RawBatch, RawRow, StoredRawRow};
pub use runs::{AttemptRow, CycleRunRow};

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS cycle_runs (
    id TEXT PRIMARY KEY,
    pipeline TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    summary TEXT
);
CREATE TABLE IF NOT EXISTS fetch_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    unit TEXT NOT NULL,
    key TEXT,
    page INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    http_status INTEGER,
    duration_ms INTEGER NOT NULL,
    error TEXT,
    attempted_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS failure_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    unit TEXT NOT NULL,
    key TEXT,
    activity TEXT NOT NULL,
    error_class TEXT NOT NULL,
    page INTEGER,
    attempts INTEGER NOT NULL,
    message TEXT NOT NULL,
    failed_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ingest_checkpoints (
    unit TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    rows INTEGER NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (unit, source_ref)
);
CREATE TABLE IF NOT EXISTS raw_columns (
    unit TEXT NOT NULL,
    name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (unit, name)
);
CREATE TABLE IF NOT EXISTS merge_watermarks (
    unit TEXT PRIMARY KEY,
    last_row_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cycle_runs_status ON cycle_runs(status);
CREATE INDEX IF NOT EXISTS idx_fetch_attempts_run ON fetch_attempts(run_id);
CREATE INDEX IF NOT EXISTS idx_failure_records_run ON failure_records(run_id);
";

pub struct Warehouse {
    conn: Mutex<Connection>,
}

impl Warehouse {
    /// Open or create a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> TransitFlowResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> TransitFlowResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> TransitFlowResult<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn lock(&self) -> TransitFlowResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> TransitFlowResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> TransitFlowResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(names.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            _ => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("raw_arrivals"), "\"raw_arrivals\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn json_values_survive_sqlite() {
        let warehouse = Warehouse::in_memory().unwrap();
        let conn = warehouse.lock().unwrap();
        conn.execute_batch("CREATE TABLE t (v)").unwrap();
        for value in [json!(null), json!(7), json!(2.5), json!("x")] {
            conn.execute("INSERT INTO t (v) VALUES (?1)", [to_sql(&value)]).unwrap();
        }
        let mut stmt = conn.prepare("SELECT v FROM t ORDER BY rowid").unwrap();
        let read: Vec<Value> = stmt
            .query_map([], |row| Ok(from_sql(row.get_ref(0)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, vec![json!(null), json!(7), json!(2.5), json!("x")]);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warehouse.db");
        let warehouse = Warehouse::open(&path).unwrap();
        assert!(path.exists());
        assert!(table_exists(&warehouse.lock().unwrap(), "cycle_runs").unwrap());
    }
}
