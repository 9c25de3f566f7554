use std::path::Path;
use std::time::Duration;

use crate::config::types::PipelineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for transitflow_utils::error::Error {
    fn from(err: ConfigError) -> Self {
        transitflow_utils::error::Error::Config(err.to_string())
    }
}

/// Load a pipeline config from a YAML file.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a pipeline config from a YAML string.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = serde_yaml::from_str(yaml)?;
    Ok(config)
}

/// Load every `.yaml`/`.yml` pipeline config in a directory, in file name order.
pub fn load_pipelines_dir(dir: impl AsRef<Path>) -> Result<Vec<PipelineConfig>, ConfigError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            paths.push(path);
        }
    }
    paths.sort();
    paths.into_iter().map(load_pipeline).collect()
}

/// Parse "250ms", "30s", "5m", "1h" or "2d".
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::Invalid(format!("duration '{raw}' has no unit")))?;
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        return Err(ConfigError::Invalid(format!("duration '{raw}' has no amount")));
    }
    let out_of_range = || ConfigError::Invalid(format!("duration '{raw}' is out of range"));
    let amount: u64 = digits.parse().map_err(|_| out_of_range())?;
    let seconds_per = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => {
            return Err(ConfigError::Invalid(format!(
                "duration '{raw}' has unknown unit '{other}'"
            )))
        }
    };
    let duration = Duration::from_secs(amount.checked_mul(seconds_per).ok_or_else(out_of_range)?);
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{
        AggregationConfig, FieldType, IterationConfig, LookupConfig, PaginationConfig, TieBreak,
    };

    const TRANSIT_YAML: &str = r#"
pipeline: transit_hourly
description: "Arrivals and vehicle positions"

run:
  concurrency: 8
  attempt_timeout: 10s
  tie_break: most_complete

lookups:
  lines:
    type: static
    keys: ["L1", "L2"]
  stops:
    type: reference
    table: stops
    column: stop_id

units:
  arrivals:
    endpoint: "https://api.transit.example/lines/{line_id}/arrivals"
    items_path: data.arrivals
    has_more_field: data.has_more
    max_pages: 20
    iteration:
      type: lookup
      lookup: lines
      placeholder: line_id
    pagination:
      type: page_number
      param: page
    retry:
      max_attempts: 4
      base_delay: 500ms

  stop_catalog:
    endpoint: "https://api.transit.example/stops"
    pagination:
      type: cursor
      param: after
      next_field: meta.next

curation:
  arrivals:
    line: line_id
    stop: stop_id
    vehicle: vehicle_id
    timestamp: expected_at
    fields:
      - name: delay_seconds
        column: delay
        type: int
      - name: status
        type: text

references:
  stops:
    key: stop_id

enrichment:
  arrivals:
    - reference: stops
      on: stop_id
      fields: [stop_name, region_code]

aggregations:
  - type: count_by
    name: arrivals_per_region
    unit: arrivals
    dimension: stops_region_code
"#;

    #[test]
    fn parse_transit_pipeline() {
        let config = parse_pipeline(TRANSIT_YAML).unwrap();
        assert_eq!(config.pipeline, "transit_hourly");
        assert_eq!(config.run.concurrency, 8);
        assert_eq!(config.run.tie_break, TieBreak::MostComplete);
        // Unspecified run settings fall back to defaults.
        assert_eq!(config.run.max_files_per_cycle, 500);

        assert_eq!(config.units.len(), 2);
        let arrivals = &config.units["arrivals"];
        assert_eq!(arrivals.method, "GET");
        assert_eq!(arrivals.retry.max_attempts, 4);
        assert_eq!(arrivals.retry.max_delay, "30s");
        assert!(matches!(
            arrivals.iteration,
            IterationConfig::Lookup { ref lookup, ref placeholder } if lookup == "lines" && placeholder == "line_id"
        ));
        assert!(matches!(
            arrivals.pagination,
            PaginationConfig::PageNumber { start: 1, .. }
        ));

        let stops = &config.units["stop_catalog"];
        assert!(matches!(stops.iteration, IterationConfig::None));
        assert!(matches!(stops.pagination, PaginationConfig::Cursor { .. }));

        assert!(matches!(config.lookups["stops"], LookupConfig::Reference { .. }));
        let curation = &config.curation["arrivals"];
        assert_eq!(curation.fields[0].field_type, FieldType::Int);
        assert_eq!(config.enrichment["arrivals"][0].column_prefix(), "stops_");
        assert!(matches!(config.aggregations[0], AggregationConfig::CountBy { .. }));
    }

    #[test]
    fn unknown_pagination_type_is_rejected() {
        let yaml = r#"
pipeline: broken
units:
  arrivals:
    endpoint: "https://api.transit.example/arrivals"
    pagination:
      type: scroll
"#;
        assert!(matches!(parse_pipeline(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ten s").is_err());
        assert!(parse_duration("3w").is_err());
    }

    #[test]
    fn directory_loads_yaml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yml"), "pipeline: second\nunits: {}\n").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "pipeline: first\nunits: {}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a pipeline").unwrap();

        let configs = load_pipelines_dir(dir.path()).unwrap();
        let names: Vec<&str> = configs.iter().map(|c| c.pipeline.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        for raw in ["18446744073709551615d", "5124095576030432h", "99999999999999999999s"] {
            let err = parse_duration(raw).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("out of range")), "{raw}: {err}");
        }
        assert!(parse_duration("18446744073709551615ms").is_ok());
    }
}
