use rusqlite::params;
use transitflow_utils::TransitFlowResult;

use super::Warehouse;
use crate::failures::{FailureRecord, FailureSink};

/// One row of `cycle_runs`.
#[derive(Debug)]
pub struct CycleRunRow {
    pub id: String,
    pub pipeline: String,
    pub trigger_type: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub summary: Option<String>,
}

/// One fetch attempt, successful or not.
#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub run_id: String,
    pub unit: String,
    pub key: Option<String>,
    pub page: u64,
    pub attempt: u32,
    pub outcome: String,
    pub http_status: Option<u16>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl Warehouse {
    /// Record a cycle as running. Retrying a run id restarts its row.
    pub fn insert_cycle_run(&self, id: &str, pipeline: &str, trigger_type: &str, started_at: &str) -> TransitFlowResult<()> {
        self.lock()?.execute(
            "INSERT INTO cycle_runs (id, pipeline, trigger_type, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)
             ON CONFLICT(id) DO UPDATE SET
                trigger_type = excluded.trigger_type, status = 'running', started_at = excluded.started_at,
                finished_at = NULL, duration_ms = NULL, summary = NULL",
            params![id, pipeline, trigger_type, started_at],
        )?;
        Ok(())
    }

    pub fn complete_cycle_run(
        &self,
        id: &str,
        status: &str,
        finished_at: &str,
        duration_ms: i64,
        summary: &str,
    ) -> TransitFlowResult<()> {
        self.lock()?.execute(
            "UPDATE cycle_runs SET status = ?2, finished_at = ?3, duration_ms = ?4, summary = ?5 WHERE id = ?1",
            params![id, status, finished_at, duration_ms, summary],
        )?;
        Ok(())
    }

    /// Mark cycles left running by a dead process as crashed.
    pub fn mark_inflight_as_crashed(&self) -> TransitFlowResult<usize> {
        let count = self.lock()?.execute(
            "UPDATE cycle_runs SET status = 'crashed' WHERE status = 'running'",
            [],
        )?;
        Ok(count)
    }

    pub fn recent_runs(&self, limit: usize) -> TransitFlowResult<Vec<CycleRunRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, pipeline, trigger_type, status, started_at, finished_at, duration_ms, summary
             FROM cycle_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(CycleRunRow {
                id: row.get(0)?,
                pipeline: row.get(1)?,
                trigger_type: row.get(2)?,
                status: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
                duration_ms: row.get(6)?,
                summary: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_attempt(&self, attempt: &AttemptRow) -> TransitFlowResult<()> {
        self.lock()?.execute(
            "INSERT INTO fetch_attempts (run_id, unit, key, page, attempt, outcome, http_status, duration_ms, error, attempted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                attempt.run_id,
                attempt.unit,
                attempt.key,
                attempt.page as i64,
                attempt.attempt,
                attempt.outcome,
                attempt.http_status,
                attempt.duration_ms,
                attempt.error,
                super::now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn attempts_for(&self, run_id: &str) -> TransitFlowResult<Vec<AttemptRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, unit, key, page, attempt, outcome, http_status, duration_ms, error
             FROM fetch_attempts WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(AttemptRow {
                run_id: row.get(0)?,
                unit: row.get(1)?,
                key: row.get(2)?,
                page: row.get::<_, i64>(3)? as u64,
                attempt: row.get(4)?,
                outcome: row.get(5)?,
                http_status: row.get(6)?,
                duration_ms: row.get(7)?,
                error: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Failure records for one run as `(unit, key, error_class, activity, attempts)`.
    pub fn failures_for(&self, run_id: &str) -> TransitFlowResult<Vec<(String, Option<String>, String, String, u32)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT unit, key, error_class, activity, attempts FROM failure_records WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl FailureSink for Warehouse {
    fn append(&self, records: &[FailureRecord]) -> TransitFlowResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO failure_records (run_id, unit, key, activity, error_class, page, attempts, message, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.run_id,
                    r.unit,
                    r.key,
                    r.activity.as_str(),
                    r.class.as_str(),
                    r.page.map(|p| p as i64),
                    r.attempts,
                    r.message,
                    r.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }
}
