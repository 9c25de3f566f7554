use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: String,
    pub description: Option<String>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub lookups: BTreeMap<String, LookupConfig>,
    /// The metadata catalog: one entry per ingestion unit.
    pub units: BTreeMap<String, UnitConfig>,
    /// Curation rules keyed by unit name. Units without an entry stay raw-only.
    #[serde(default)]
    pub curation: BTreeMap<String, CurationConfig>,
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceConfig>,
    /// Ordered reference joins keyed by unit name.
    #[serde(default)]
    pub enrichment: BTreeMap<String, Vec<JoinConfig>>,
    #[serde(default)]
    pub aggregations: Vec<AggregationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Max fetch tasks in flight across the whole run.
    pub concurrency: usize,
    pub attempt_timeout: String,
    pub run_timeout: String,
    pub landing_root: String,
    /// SQLite file. In-memory when absent.
    pub warehouse: Option<String>,
    pub max_files_per_cycle: usize,
    pub max_rows_per_merge: usize,
    pub future_tolerance: String,
    pub max_event_age: Option<String>,
    pub tie_break: TieBreak,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempt_timeout: "30s".to_string(),
            run_timeout: "50m".to_string(),
            landing_root: "./landing".to_string(),
            warehouse: None,
            max_files_per_cycle: 500,
            max_rows_per_merge: 50_000,
            future_tolerance: "5m".to_string(),
            max_event_age: None,
            tie_break: TieBreak::default(),
        }
    }
}

/// Which observation survives when one batch holds several rows for a natural key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    LatestIngestion,
    EarliestIngestion,
    MostComplete,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LookupConfig {
    Static { keys: Vec<String> },
    /// Distinct values of a column in a reference table snapshot.
    Reference { table: String, column: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Name of an environment variable holding a bearer token.
    pub bearer_token_env: Option<String>,
    /// Dot path to the item array in each page. Empty means the body is the array.
    #[serde(default)]
    pub items_path: String,
    /// Dot path to a boolean "more pages" marker.
    pub has_more_field: Option<String>,
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub iteration: IterationConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub landing_path: Option<String>,
    pub source_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IterationConfig {
    #[default]
    None,
    /// Fan out one task per key; `{placeholder}` in the endpoint is replaced by the key.
    Lookup { lookup: String, placeholder: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationConfig {
    #[default]
    None,
    PageNumber {
        param: String,
        #[serde(default = "default_first_page")]
        start: u64,
        size_param: Option<String>,
        size: Option<u64>,
    },
    Offset {
        param: String,
        limit_param: String,
        limit: u64,
    },
    Cursor {
        param: String,
        /// Dot path to the next cursor in the response body.
        next_field: String,
    },
}

fn default_first_page() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: String,
    pub max_delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: "1s".to_string(),
            max_delay: "30s".to_string(),
        }
    }
}

/// Maps a unit's structured columns onto the curated contract.
#[derive(Debug, Clone, Deserialize)]
pub struct CurationConfig {
    pub line: Option<String>,
    pub stop: Option<String>,
    pub vehicle: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    /// Raw column to read. Defaults to `name`.
    pub column: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    /// Attribute used as the reference row key.
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    pub reference: String,
    /// Curated column, or a column added by an earlier join.
    pub on: String,
    pub prefix: Option<String>,
    pub fields: Vec<String>,
}

impl JoinConfig {
    pub fn column_prefix(&self) -> String {
        self.prefix.clone().unwrap_or_else(|| format!("{}_", self.reference))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationConfig {
    CountBy {
        name: String,
        unit: String,
        dimension: String,
    },
}
