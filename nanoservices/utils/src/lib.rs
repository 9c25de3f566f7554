pub mod error;

use error::Error;

pub type TransitFlowResult<T> = Result<T, Error>;

/// A flattened record: column name to JSON scalar.
pub type RowMap = serde_json::Map<String, serde_json::Value>;
