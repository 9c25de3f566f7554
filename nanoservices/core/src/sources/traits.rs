use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use transitflow_utils::TransitFlowResult;
use url::Url;

use crate::failures::ErrorClass;

/// One page request, fully rendered from an ingestion unit.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// A failed page fetch, already classified.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class:?} fetch failure (status {status:?}): {message}")]
pub struct FetchError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
    /// Upstream `Retry-After` hint, if any.
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Transient, status: None, message: message.into(), retry_after: None }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Permanent, status: None, message: message.into(), retry_after: None }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self { class: classify_status(status), status: Some(status), message: message.into(), retry_after: None }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// 5xx, rate-limit and request-timeout statuses are worth retrying; other 4xx are not.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// The paginated upstream API.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch one page. Non-2xx responses come back as a classified [`FetchError`].
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError>;
}

/// Resolves iteration keys once per run.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    fn name(&self) -> &str;

    async fn keys(&self) -> TransitFlowResult<Vec<String>>;
}
