use thiserror::Error;
use reqwest::Error as ReqwestError;
use tokio::io::Error as TokioIoError;
use arrow::error::ArrowError;
use url::ParseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Reqwest Error: {0}")]
    Http(#[from] ReqwestError),

    #[error("IO Error: {0}")]
    Io(#[from] TokioIoError),

    #[error("SQLite Error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Arrow Error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Url Error: {0}")]
    UrlParse(#[from] ParseError),

    #[error("config error: {0}")]
    Config(String),

    /// Incompatible schema change or corrupted raw payload. Needs an operator.
    #[error("structural failure on table {table}: {reason}")]
    Structural { table: String, reason: String },

    #[error("table {0} already has a merge cycle in progress")]
    TableBusy(String),

    #[error("warehouse lock poisoned")]
    LockPoisoned,
}

impl Error {
    pub fn structural(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Structural { table: table.into(), reason: reason.into() }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_error_names_table() {
        let err = Error::structural("raw_arrivals", "column delay retyped Int64 -> Utf8");
        assert!(err.is_structural());
        assert!(err.to_string().contains("raw_arrivals"));
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = inner.into();
        assert!(!err.is_structural());
        assert!(err.to_string().contains("gone"));
    }
}
