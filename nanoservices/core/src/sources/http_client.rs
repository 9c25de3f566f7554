use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as ReqwestClient, Response};
use transitflow_utils::TransitFlowResult;

use super::traits::{FetchError, PageRequest, PageResponse, Upstream};

#[derive(Debug)]
pub struct HttpUpstreamBuilder {
    user_agent: String,
    connect_timeout: Duration,
    default_headers: Vec<(String, String)>,
}

impl Default for HttpUpstreamBuilder {
    fn default() -> Self {
        Self {
            user_agent: concat!("transitflow/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            default_headers: Vec::new(),
        }
    }
}

impl HttpUpstreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_agent<T: Into<String>>(mut self, user_agent: T) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> TransitFlowResult<HttpUpstream> {
        // Per-attempt timeouts are enforced by the orchestrator, not the client.
        let client = ReqwestClient::builder()
            .user_agent(self.user_agent)
            .connect_timeout(self.connect_timeout)
            .build()?;
        Ok(HttpUpstream { client, default_headers: self.default_headers })
    }
}

/// `Upstream` backed by a shared `reqwest` client.
pub struct HttpUpstream {
    client: ReqwestClient,
    default_headers: Vec<(String, String)>,
}

impl HttpUpstream {
    pub fn builder() -> HttpUpstreamBuilder {
        HttpUpstreamBuilder::new()
    }

    async fn send(&self, request: &PageRequest) -> Result<Response, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        builder.send().await
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
        let response = self.send(request).await.map_err(classify_reqwest)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let reason = status.canonical_reason().unwrap_or("unexpected status");
            return Err(FetchError::from_status(status.as_u16(), format!("{} {}", status.as_u16(), reason))
                .with_retry_after(retry_after));
        }

        let body = response.bytes().await.map_err(classify_reqwest)?;
        Ok(PageResponse { status: status.as_u16(), body: body.to_vec() })
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_builder() || err.is_redirect() {
        return FetchError::permanent(err.to_string());
    }
    if let Some(status) = err.status() {
        return FetchError::from_status(status.as_u16(), err.to_string());
    }
    // Timeouts, refused connections and truncated bodies.
    FetchError::transient(err.to_string())
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn builder_produces_client() {
        let upstream = HttpUpstream::builder()
            .user_agent("test-agent")
            .connect_timeout(Duration::from_secs(1))
            .header("accept", "application/json")
            .build()
            .unwrap();
        assert_eq!(upstream.default_headers.len(), 1);
    }
}
