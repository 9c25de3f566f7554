use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use transitflow_utils::{RowMap, TransitFlowResult};

use crate::config::types::AggregationConfig;
use crate::warehouse::reference::key_text;
use crate::warehouse::Warehouse;

/// One row of a metric view. `dimension` is `None` for rows whose dimension value was null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub dimension: Option<String>,
    pub value: f64,
}

/// Pure function from enriched rows to a metric view.
pub trait Aggregation: Send + Sync {
    /// Metric table suffix.
    fn name(&self) -> &str;
    /// Unit whose enriched table feeds this aggregation.
    fn unit(&self) -> &str;
    fn compute(&self, rows: &[RowMap]) -> TransitFlowResult<Vec<MetricRow>>;
}

/// Counts enriched events per value of one column.
pub struct CountBy {
    name: String,
    unit: String,
    dimension: String,
}

impl CountBy {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, dimension: impl Into<String>) -> Self {
        Self { name: name.into(), unit: unit.into(), dimension: dimension.into() }
    }
}

impl Aggregation for CountBy {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn compute(&self, rows: &[RowMap]) -> TransitFlowResult<Vec<MetricRow>> {
        let mut counts: BTreeMap<Option<String>, f64> = BTreeMap::new();
        for row in rows {
            let dimension = row.get(&self.dimension).and_then(key_text);
            *counts.entry(dimension).or_default() += 1.0;
        }
        Ok(counts.into_iter().map(|(dimension, value)| MetricRow { dimension, value }).collect())
    }
}

pub fn aggregations_from_config(configs: &[AggregationConfig]) -> Vec<Arc<dyn Aggregation>> {
    configs
        .iter()
        .map(|config| match config {
            AggregationConfig::CountBy { name, unit, dimension } => {
                Arc::new(CountBy::new(name, unit, dimension)) as Arc<dyn Aggregation>
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationReport {
    /// Rows written per metric name.
    pub metrics: BTreeMap<String, usize>,
    /// Aggregations skipped because their unit was halted this cycle.
    pub skipped: Vec<String>,
    /// Aggregations that failed this cycle, with the error. Their previous
    /// metric table is left in place.
    pub failed: BTreeMap<String, String>,
}

/// Recompute every aggregation whose unit is not in `halted`, replacing its metric table.
///
/// A failing aggregation is recorded in the report and the rest still run.
pub fn run_aggregations(warehouse: &Warehouse, aggregations: &[Arc<dyn Aggregation>], halted: &[String]) -> AggregationReport {
    let mut report = AggregationReport::default();
    for aggregation in aggregations {
        if halted.iter().any(|u| u == aggregation.unit()) {
            report.skipped.push(aggregation.name().to_string());
            continue;
        }
        match refresh_metric(warehouse, aggregation.as_ref()) {
            Ok(written) => {
                tracing::debug!(metric = %aggregation.name(), rows = written, "metric view replaced");
                report.metrics.insert(aggregation.name().to_string(), written);
            }
            Err(e) => {
                tracing::error!(metric = %aggregation.name(), unit = %aggregation.unit(), error = %e, "aggregation failed");
                report.failed.insert(aggregation.name().to_string(), e.to_string());
            }
        }
    }
    report
}

fn refresh_metric(warehouse: &Warehouse, aggregation: &dyn Aggregation) -> TransitFlowResult<usize> {
    let rows = warehouse.enriched_rows(aggregation.unit())?;
    let metric = aggregation.compute(&rows)?;
    warehouse.replace_metric(aggregation.name(), &metric)
}
