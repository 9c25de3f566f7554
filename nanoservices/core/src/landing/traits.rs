use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use transitflow_utils::TransitFlowResult;

/// Address of one landed raw record, relative to the landing root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRef(pub String);

impl SourceRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One successful page fetch, as handed to the landing writer.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub unit: String,
    pub landing_path: String,
    pub key: Option<String>,
    pub page: u64,
    pub run_id: String,
    pub ingested_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Metadata stored alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandingHeader {
    pub unit: String,
    pub key: Option<String>,
    pub page: u64,
    pub run_id: String,
    pub ingested_at: String,
}

#[derive(Debug, Clone)]
pub struct LandedRecord {
    pub header: LandingHeader,
    pub payload: Vec<u8>,
}

/// Append-only raw storage. Records are never rewritten or removed.
#[async_trait]
pub trait RawLanding: Send + Sync {
    async fn append(&self, record: RawRecord) -> TransitFlowResult<SourceRef>;

    /// Every record under `landing_path`, oldest first.
    async fn list(&self, landing_path: &str) -> TransitFlowResult<Vec<SourceRef>>;

    async fn read(&self, source_ref: &SourceRef) -> TransitFlowResult<LandedRecord>;
}
