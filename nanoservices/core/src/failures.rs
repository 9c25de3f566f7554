//! Failure records and the append-only sink they are routed to.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use transitflow_utils::error::Error;
use transitflow_utils::TransitFlowResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Cancelled,
    RunTimeout,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::RunTimeout => "run_timeout",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the task was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Lookup,
    Fetch,
    Land,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Lookup => "lookup",
            Activity::Fetch => "fetch",
            Activity::Land => "land",
        }
    }
}

/// Enough context to replay exactly the failed (unit, key) scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub unit: String,
    pub key: Option<String>,
    pub activity: Activity,
    pub class: ErrorClass,
    pub page: Option<u64>,
    pub attempts: u32,
    pub message: String,
    pub run_id: String,
    pub timestamp: String,
}

impl FailureRecord {
    pub fn new(unit: &str, key: Option<&str>, activity: Activity, class: ErrorClass, run_id: &str) -> Self {
        Self {
            unit: unit.to_string(),
            key: key.map(str::to_string),
            activity,
            class,
            page: None,
            attempts: 0,
            message: String::new(),
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Append-only destination for failure records. The pipeline never reads it back.
pub trait FailureSink: Send + Sync {
    fn append(&self, records: &[FailureRecord]) -> TransitFlowResult<usize>;
}

/// Collects records in memory.
#[derive(Default)]
pub struct MemoryFailureSink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl FailureSink for MemoryFailureSink {
    fn append(&self, records: &[FailureRecord]) -> TransitFlowResult<usize> {
        let mut guard = self.records.lock().map_err(|_| Error::LockPoisoned)?;
        guard.extend_from_slice(records);
        Ok(records.len())
    }
}

/// Hand a run's failure records to the sink.
///
/// A sink error is logged and counted, then returned so the caller can flag the
/// cycle; it never stops the run.
pub fn persist_failures(sink: &dyn FailureSink, run_id: &str, records: &[FailureRecord]) -> TransitFlowResult<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    for record in records {
        crate::metrics::inc_failure(&record.unit, record.class.as_str());
    }
    match sink.append(records) {
        Ok(appended) => {
            tracing::info!(run = %run_id, failures = appended, "persisted failure records");
            Ok(appended)
        }
        Err(e) => {
            tracing::error!(run = %run_id, failures = records.len(), error = %e, "failed to persist failure records");
            crate::metrics::inc_failure_sink_error();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_appends() {
        let sink = MemoryFailureSink::new();
        let record = FailureRecord::new("arrivals", Some("L1"), Activity::Fetch, ErrorClass::Permanent, "run-1")
            .page(2)
            .attempts(1)
            .message("404 Not Found");
        assert_eq!(persist_failures(&sink, "run-1", &[record.clone()]).unwrap(), 1);
        assert_eq!(persist_failures(&sink, "run-1", &[]).unwrap(), 0);

        let records = sink.records();
        assert_eq!(records, vec![record]);
        assert_eq!(records[0].class.as_str(), "permanent");
    }

    struct Unwritable;

    impl FailureSink for Unwritable {
        fn append(&self, _records: &[FailureRecord]) -> TransitFlowResult<usize> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "failure log is read-only")))
        }
    }

    #[test]
    fn sink_error_is_returned_to_the_caller() {
        let record = FailureRecord::new("arrivals", None, Activity::Fetch, ErrorClass::Transient, "run-1");
        let err = persist_failures(&Unwritable, "run-1", &[record]).unwrap_err();
        assert!(err.to_string().contains("read-only"));
        assert!(persist_failures(&Unwritable, "run-1", &[]).is_ok());
    }

    #[test]
    fn classes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorClass::RunTimeout).unwrap();
        assert_eq!(json, "\"run_timeout\"");
    }
}
