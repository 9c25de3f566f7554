use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::aggregate::{aggregations_from_config, Aggregation};
use crate::catalog::Catalog;
use crate::config::loader::{load_pipeline, parse_duration, ConfigError};
use crate::config::PipelineConfig;
use crate::failures::FailureSink;
use crate::ingest::SchemaEvolvingIngestor;
use crate::landing::{FileLanding, RawLanding};
use crate::merge::{Curation, MergeEngine, MergeSettings, TableLocks};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::pipeline::Pipeline;
use crate::sources::{lookups_from_config, HttpUpstream, KeyLookup, Upstream};
use crate::warehouse::Warehouse;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("duration out of range: {0}")]
    Duration(String),
    #[error("cannot open warehouse: {0}")]
    Warehouse(transitflow_utils::error::Error),
    #[error("cannot build http client: {0}")]
    Upstream(transitflow_utils::error::Error),
}

/// Assembles a [`Pipeline`] from configuration, with every collaborator overridable.
pub struct PipelineBuilder {
    config: PipelineConfig,
    upstream: Option<Arc<dyn Upstream>>,
    landing: Option<Arc<dyn RawLanding>>,
    failure_sink: Option<Arc<dyn FailureSink>>,
    warehouse: Option<Arc<Warehouse>>,
    table_locks: Option<Arc<TableLocks>>,
    lookups: BTreeMap<String, Arc<dyn KeyLookup>>,
    aggregations: Vec<Arc<dyn Aggregation>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            upstream: None,
            landing: None,
            failure_sink: None,
            warehouse: None,
            table_locks: None,
            lookups: BTreeMap::new(),
            aggregations: Vec::new(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        Ok(Self::new(load_pipeline(path)?))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn upstream(mut self, upstream: impl Upstream + 'static) -> Self {
        self.upstream = Some(Arc::new(upstream));
        self
    }

    pub fn landing(mut self, landing: impl RawLanding + 'static) -> Self {
        self.landing = Some(Arc::new(landing));
        self
    }

    pub fn failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    pub fn warehouse(mut self, warehouse: Arc<Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Share merge exclusion with other pipelines writing the same tables.
    pub fn table_locks(mut self, locks: Arc<TableLocks>) -> Self {
        self.table_locks = Some(locks);
        self
    }

    /// Replace the configured lookup of the same name.
    pub fn lookup(mut self, lookup: impl KeyLookup + 'static) -> Self {
        self.lookups.insert(lookup.name().to_string(), Arc::new(lookup));
        self
    }

    pub fn aggregation(mut self, aggregation: impl Aggregation + 'static) -> Self {
        self.aggregations.push(Arc::new(aggregation));
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        let config = self.config;
        let run = &config.run;
        let catalog = Catalog::from_config(&config)?;

        let warehouse = match self.warehouse {
            Some(warehouse) => warehouse,
            None => Arc::new(match &run.warehouse {
                Some(path) => Warehouse::open(path).map_err(BuildError::Warehouse)?,
                None => Warehouse::in_memory().map_err(BuildError::Warehouse)?,
            }),
        };
        let landing = self
            .landing
            .unwrap_or_else(|| Arc::new(FileLanding::new(&run.landing_root)) as Arc<dyn RawLanding>);
        let upstream = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(
                HttpUpstream::builder()
                    .user_agent(format!("transitflow/{}", config.pipeline))
                    .build()
                    .map_err(BuildError::Upstream)?,
            ),
        };
        let failure_sink: Arc<dyn FailureSink> = self
            .failure_sink
            .unwrap_or_else(|| warehouse.clone() as Arc<dyn FailureSink>);

        let mut lookups = lookups_from_config(&config.lookups, &warehouse);
        lookups.extend(self.lookups);

        let mut curations = BTreeMap::new();
        for (unit, curation) in &config.curation {
            let source_id = catalog
                .get(unit)
                .map(|u| u.source_id.clone())
                .ok_or_else(|| ConfigError::Invalid(format!("curation for unknown unit {unit}")))?;
            curations.insert(unit.clone(), Curation::from_config(unit, &source_id, curation));
        }

        let orchestrator = Orchestrator::new(
            upstream,
            landing.clone(),
            warehouse.clone(),
            failure_sink,
            lookups,
            OrchestratorSettings {
                concurrency: run.concurrency.max(1),
                attempt_timeout: parse_duration(&run.attempt_timeout)?,
                run_timeout: parse_duration(&run.run_timeout)?,
            },
        );
        let ingestor = SchemaEvolvingIngestor::new(landing, warehouse.clone(), run.max_files_per_cycle);
        let merge = MergeEngine::new(
            warehouse.clone(),
            self.table_locks.unwrap_or_default(),
            MergeSettings {
                tie_break: run.tie_break,
                future_tolerance: chrono_duration(&run.future_tolerance)?,
                max_event_age: run.max_event_age.as_deref().map(chrono_duration).transpose()?,
                max_rows_per_batch: run.max_rows_per_merge.max(1),
            },
        );

        let mut aggregations = aggregations_from_config(&config.aggregations);
        aggregations.extend(self.aggregations);

        tracing::debug!(pipeline = %config.pipeline, units = catalog.units().len(), curated = curations.len(), "pipeline built");
        Ok(Pipeline::new(
            config.pipeline.clone(),
            catalog,
            curations,
            config.enrichment.clone(),
            orchestrator,
            ingestor,
            merge,
            aggregations,
            warehouse,
        ))
    }
}

fn chrono_duration(raw: &str) -> Result<chrono::Duration, BuildError> {
    let duration = parse_duration(raw)?;
    chrono::Duration::from_std(duration).map_err(|_| BuildError::Duration(raw.to_string()))
}
