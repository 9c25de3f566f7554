//! The metadata catalog: validated, immutable ingestion unit descriptors.
//!
//! The catalog holds no behaviour of its own. The orchestrator walks it and
//! switches on the tagged [`Iteration`] and [`Pagination`] variants, so adding
//! an endpoint means adding a YAML entry rather than another code path.

use std::collections::HashSet;
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::config::loader::ConfigError;
use crate::config::types::{
    AggregationConfig, IterationConfig, LookupConfig, PipelineConfig, UnitConfig,
};
use crate::orchestrator::retry::RetryPolicy;
use crate::warehouse::curated::is_reserved_column;

pub use crate::config::types::PaginationConfig as Pagination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    None,
    Lookup { lookup: String, placeholder: String },
}

/// Position within a paginated endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    First,
    Number(u64),
    Offset(u64),
    Token(String),
}

#[derive(Debug, Clone)]
pub struct IngestionUnit {
    pub name: String,
    pub source_id: String,
    pub endpoint: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer_token_env: Option<String>,
    pub items_path: String,
    pub has_more_field: Option<String>,
    pub max_pages: Option<u32>,
    pub iteration: Iteration,
    pub pagination: Pagination,
    pub retry: RetryPolicy,
    pub landing_path: String,
}

impl IngestionUnit {
    pub fn from_config(name: &str, config: &UnitConfig) -> Result<Self, ConfigError> {
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::Invalid(format!("unit {name}: bad method {}", config.method)))?;

        let iteration = match &config.iteration {
            IterationConfig::None => Iteration::None,
            IterationConfig::Lookup { lookup, placeholder } => {
                if !config.endpoint.contains(&format!("{{{placeholder}}}")) {
                    return Err(ConfigError::Invalid(format!(
                        "unit {name}: endpoint has no {{{placeholder}}} placeholder"
                    )));
                }
                Iteration::Lookup { lookup: lookup.clone(), placeholder: placeholder.clone() }
            }
        };

        if config.max_pages == Some(0) {
            return Err(ConfigError::Invalid(format!("unit {name}: max_pages must be positive")));
        }

        let unit = Self {
            name: name.to_string(),
            source_id: config.source_id.clone().unwrap_or_else(|| name.to_string()),
            endpoint: config.endpoint.clone(),
            method,
            query: config.query.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            headers: config.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            bearer_token_env: config.bearer_token_env.clone(),
            items_path: config.items_path.clone(),
            has_more_field: config.has_more_field.clone(),
            max_pages: config.max_pages,
            iteration,
            pagination: config.pagination.clone(),
            retry: RetryPolicy::from_config(&config.retry)
                .map_err(|e| ConfigError::Invalid(format!("unit {name}: {e}")))?,
            landing_path: config.landing_path.clone().unwrap_or_else(|| name.to_string()),
        };

        // Render once with a dummy key so a broken template fails at load time.
        unit.render_url(Some("sample"), &PageCursor::First)
            .map_err(|e| ConfigError::Invalid(format!("unit {name}: bad endpoint: {e}")))?;
        Ok(unit)
    }

    /// Build the request URL for one page of this unit.
    pub fn render_url(&self, key: Option<&str>, cursor: &PageCursor) -> Result<Url, url::ParseError> {
        let mut endpoint = self.endpoint.clone();
        if let (Iteration::Lookup { placeholder, .. }, Some(key)) = (&self.iteration, key) {
            endpoint = endpoint.replace(&format!("{{{placeholder}}}"), &utf8_percent_encode(key, KEY_COMPONENT).to_string());
        }
        let mut url = Url::parse(&endpoint)?;

        let mut extra: Vec<(String, String)> = self.query.clone();
        match (&self.pagination, cursor) {
            (Pagination::None, _) => {}
            (Pagination::PageNumber { param, start, size_param, size }, cursor) => {
                let number = match cursor {
                    PageCursor::Number(n) => *n,
                    _ => *start,
                };
                extra.push((param.clone(), number.to_string()));
                if let (Some(size_param), Some(size)) = (size_param, size) {
                    extra.push((size_param.clone(), size.to_string()));
                }
            }
            (Pagination::Offset { param, limit_param, limit }, cursor) => {
                let offset = match cursor {
                    PageCursor::Offset(n) => *n,
                    _ => 0,
                };
                extra.push((param.clone(), offset.to_string()));
                extra.push((limit_param.clone(), limit.to_string()));
            }
            (Pagination::Cursor { param, .. }, PageCursor::Token(token)) => {
                extra.push((param.clone(), token.clone()));
            }
            (Pagination::Cursor { .. }, _) => {}
        }

        if !extra.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &extra {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// The item array of a page body, if the body has one at `items_path`.
    pub fn items<'a>(&self, body: &'a Value) -> Option<&'a Vec<Value>> {
        value_at(body, &self.items_path)?.as_array()
    }

    /// Where the page after `cursor` starts, or `None` when pagination is over.
    ///
    /// Termination on empty pages and `max_pages` is the caller's concern.
    pub fn next_cursor(&self, cursor: &PageCursor, body: &Value, item_count: usize) -> Option<PageCursor> {
        if let Some(marker) = &self.has_more_field {
            if value_at(body, marker).and_then(Value::as_bool) == Some(false) {
                return None;
            }
        }
        match &self.pagination {
            Pagination::None => None,
            Pagination::PageNumber { start, .. } => {
                let current = match cursor {
                    PageCursor::Number(n) => *n,
                    _ => *start,
                };
                Some(PageCursor::Number(current + 1))
            }
            Pagination::Offset { limit, .. } => {
                let current = match cursor {
                    PageCursor::Offset(n) => *n,
                    _ => 0,
                };
                let step = (*limit).max(item_count as u64);
                Some(PageCursor::Offset(current + step))
            }
            Pagination::Cursor { next_field, .. } => match value_at(body, next_field) {
                Some(Value::String(token)) if !token.is_empty() => Some(PageCursor::Token(token.clone())),
                Some(Value::Number(n)) => Some(PageCursor::Token(n.to_string())),
                _ => None,
            },
        }
    }
}

/// Follow a dot path ("data.items") into a JSON value. Empty path is the value itself.
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Everything except RFC 3986 unreserved characters.
const KEY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// All ingestion units of a pipeline, in name order.
#[derive(Debug, Clone)]
pub struct Catalog {
    units: Vec<Arc<IngestionUnit>>,
}

impl Catalog {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        if config.units.is_empty() {
            return Err(ConfigError::Invalid("catalog has no units".into()));
        }

        let mut units = Vec::with_capacity(config.units.len());
        for (name, unit_config) in &config.units {
            let unit = IngestionUnit::from_config(name, unit_config)?;
            if let Iteration::Lookup { lookup, .. } = &unit.iteration {
                if !config.lookups.contains_key(lookup) {
                    return Err(ConfigError::Invalid(format!("unit {name}: unknown lookup {lookup}")));
                }
            }
            units.push(Arc::new(unit));
        }

        for (name, lookup) in &config.lookups {
            if let LookupConfig::Reference { table, .. } = lookup {
                if !config.references.contains_key(table) {
                    return Err(ConfigError::Invalid(format!("lookup {name}: unknown reference {table}")));
                }
            }
        }
        for (unit, curation) in &config.curation {
            if !config.units.contains_key(unit) {
                return Err(ConfigError::Invalid(format!("curation for unknown unit {unit}")));
            }
            let mut seen = HashSet::new();
            for field in &curation.fields {
                if is_reserved_column(&field.name) {
                    return Err(ConfigError::Invalid(format!(
                        "curation for {unit}: field {} clashes with a reserved column",
                        field.name
                    )));
                }
                if !seen.insert(field.name.to_ascii_lowercase()) {
                    return Err(ConfigError::Invalid(format!("curation for {unit}: duplicate field {}", field.name)));
                }
            }
        }
        for (unit, joins) in &config.enrichment {
            if !config.curation.contains_key(unit) {
                return Err(ConfigError::Invalid(format!("enrichment for uncurated unit {unit}")));
            }
            for join in joins {
                if !config.references.contains_key(&join.reference) {
                    return Err(ConfigError::Invalid(format!(
                        "enrichment for {unit}: unknown reference {}",
                        join.reference
                    )));
                }
            }
        }
        for aggregation in &config.aggregations {
            let AggregationConfig::CountBy { name, unit, .. } = aggregation;
            if !config.curation.contains_key(unit) {
                return Err(ConfigError::Invalid(format!("aggregation {name}: uncurated unit {unit}")));
            }
        }

        Ok(Self { units })
    }

    pub fn units(&self) -> &[Arc<IngestionUnit>] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&Arc<IngestionUnit>> {
        self.units.iter().find(|u| u.name == name)
    }

}
