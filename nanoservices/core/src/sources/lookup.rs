use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use transitflow_utils::TransitFlowResult;

use super::traits::KeyLookup;
use crate::config::types::LookupConfig;
use crate::warehouse::Warehouse;

/// Keys listed inline in the pipeline config.
pub struct StaticKeys {
    name: String,
    keys: Vec<String>,
}

impl StaticKeys {
    pub fn new(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self { name: name.into(), keys }
    }
}

#[async_trait]
impl KeyLookup for StaticKeys {
    fn name(&self) -> &str {
        &self.name
    }

    async fn keys(&self) -> TransitFlowResult<Vec<String>> {
        Ok(self.keys.clone())
    }
}

/// Distinct values of one attribute in the latest reference snapshot.
pub struct ReferenceKeys {
    name: String,
    warehouse: Arc<Warehouse>,
    table: String,
    column: String,
}

impl ReferenceKeys {
    pub fn new(name: impl Into<String>, warehouse: Arc<Warehouse>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self { name: name.into(), warehouse, table: table.into(), column: column.into() }
    }
}

#[async_trait]
impl KeyLookup for ReferenceKeys {
    fn name(&self) -> &str {
        &self.name
    }

    async fn keys(&self) -> TransitFlowResult<Vec<String>> {
        self.warehouse.reference_values(&self.table, &self.column)
    }
}

/// Build every configured lookup against `warehouse`.
pub fn lookups_from_config(
    configs: &BTreeMap<String, LookupConfig>,
    warehouse: &Arc<Warehouse>,
) -> BTreeMap<String, Arc<dyn KeyLookup>> {
    configs
        .iter()
        .map(|(name, config)| {
            let lookup: Arc<dyn KeyLookup> = match config {
                LookupConfig::Static { keys } => Arc::new(StaticKeys::new(name, keys.clone())),
                LookupConfig::Reference { table, column } => {
                    Arc::new(ReferenceKeys::new(name, warehouse.clone(), table, column))
                }
            };
            (name.clone(), lookup)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reference_keys_read_distinct_values() {
        let warehouse = Arc::new(Warehouse::in_memory().unwrap());
        let rows = vec![
            json!({ "stop_id": "S1", "line_id": "L1" }),
            json!({ "stop_id": "S2", "line_id": "L1" }),
            json!({ "stop_id": "S3", "line_id": "L2" }),
        ];
        warehouse.replace_reference("stops", "stop_id", &rows).unwrap();

        let mut configs = BTreeMap::new();
        configs.insert("lines".to_string(), LookupConfig::Reference { table: "stops".into(), column: "line_id".into() });
        configs.insert("fixed".to_string(), LookupConfig::Static { keys: vec!["A".into()] });
        let lookups = lookups_from_config(&configs, &warehouse);

        assert_eq!(lookups["lines"].keys().await.unwrap(), vec!["L1", "L2"]);
        assert_eq!(lookups["fixed"].keys().await.unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn missing_reference_yields_no_keys() {
        let warehouse = Arc::new(Warehouse::in_memory().unwrap());
        let lookup = ReferenceKeys::new("stops", warehouse, "stops", "stop_id");
        assert!(lookup.keys().await.unwrap().is_empty());
    }
}
