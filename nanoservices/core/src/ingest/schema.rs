//! Payload flattening, schema inference and the additive evolution policy.

use std::collections::{HashMap, HashSet};

use arrow::datatypes::{DataType, Schema};
use arrow::error::ArrowError;
use arrow_json::reader::infer_json_schema_from_iterator;
use serde_json::Value;
use transitflow_utils::RowMap;

use crate::warehouse::raw::LINEAGE_COLUMNS;

/// A payload that cannot be appended without breaking existing readers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaConflict {
    /// An existing column received values of an incompatible type.
    #[error("column {column} of {table} is {existing:?} but a payload carries {incoming:?}")]
    Retyped {
        table: String,
        column: String,
        existing: DataType,
        incoming: DataType,
    },
    /// Column names are case-insensitive in the warehouse.
    #[error("column {column} of {table} differs from column {existing} only by case")]
    CaseCollision {
        table: String,
        column: String,
        existing: String,
    },
}

impl SchemaConflict {
    pub fn column(&self) -> &str {
        match self {
            SchemaConflict::Retyped { column, .. } | SchemaConflict::CaseCollision { column, .. } => column,
        }
    }
}

/// Two payload fields of one item map to the same column after flattening.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("payload fields collide on column {column} after flattening")]
pub struct FlattenCollision {
    pub column: String,
}

/// Columns to add and columns whose catalog type is refined from `Null`.
#[derive(Debug, Default, PartialEq)]
pub struct Evolution {
    pub added: Vec<(String, DataType)>,
    pub upgraded: Vec<(String, DataType)>,
}

impl Evolution {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.upgraded.is_empty()
    }
}

/// Flatten one payload item into scalar columns.
///
/// Nested objects become `parent_child` columns, arrays are kept as JSON
/// text and a non-object item lands in a single `value` column. Two fields
/// landing on the same column, ignoring case, are a collision.
pub fn flatten_item(item: &Value) -> Result<RowMap, FlattenCollision> {
    let mut flat = Flattened::default();
    match item {
        Value::Object(map) => {
            for (key, value) in map {
                flat.push(key, value)?;
            }
        }
        other => flat.push("value", other)?,
    }
    Ok(flat.row)
}

#[derive(Default)]
struct Flattened {
    row: RowMap,
    seen: HashSet<String>,
}

impl Flattened {
    fn push(&mut self, prefix: &str, value: &Value) -> Result<(), FlattenCollision> {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, nested) in map {
                    self.push(&format!("{prefix}_{key}"), nested)?;
                }
                Ok(())
            }
            Value::Object(_) => self.insert(prefix, Value::Null),
            Value::Array(_) => self.insert(prefix, Value::String(value.to_string())),
            scalar => self.insert(prefix, scalar.clone()),
        }
    }

    fn insert(&mut self, raw: &str, value: Value) -> Result<(), FlattenCollision> {
        let column = column_name(raw);
        if !self.seen.insert(column.to_ascii_lowercase()) {
            return Err(FlattenCollision { column });
        }
        self.row.insert(column, value);
        Ok(())
    }
}

fn column_name(raw: &str) -> String {
    let reserved = raw.eq_ignore_ascii_case("_row_id") || LINEAGE_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(raw));
    if reserved {
        format!("payload{raw}")
    } else {
        raw.to_string()
    }
}

/// Infer an Arrow schema for a set of flattened rows.
pub fn infer_schema(rows: &[RowMap]) -> Result<Schema, ArrowError> {
    let values: Vec<Value> = rows.iter().cloned().map(Value::Object).collect();
    infer_json_schema_from_iterator(values.iter().map(Ok::<_, ArrowError>))
}

/// Compare an incoming schema with the stored column catalog.
///
/// New columns are added as nullable. A stored `Null` column adopts the
/// first concrete type it sees; integers are accepted into a float column.
/// Anything else that differs is a conflict, and so is a new column whose
/// name matches another one except for case.
pub fn evolve(
    table: &str,
    current: &[(String, DataType)],
    incoming: &Schema,
) -> Result<Evolution, SchemaConflict> {
    let known: HashMap<&str, &DataType> = current.iter().map(|(n, t)| (n.as_str(), t)).collect();
    let mut folded: HashMap<String, &str> = current.iter().map(|(n, _)| (n.to_ascii_lowercase(), n.as_str())).collect();
    let mut evolution = Evolution::default();

    for field in incoming.fields() {
        let name = field.name().as_str();
        let incoming_type = normalize(field.data_type());
        match known.get(name) {
            None => {
                if let Some(existing) = folded.insert(name.to_ascii_lowercase(), name) {
                    return Err(SchemaConflict::CaseCollision {
                        table: table.to_string(),
                        column: name.to_string(),
                        existing: existing.to_string(),
                    });
                }
                evolution.added.push((name.to_string(), incoming_type));
            }
            Some(existing) => {
                let existing = *existing;
                if *existing == incoming_type || incoming_type == DataType::Null {
                    continue;
                }
                if *existing == DataType::Null {
                    evolution.upgraded.push((name.to_string(), incoming_type));
                    continue;
                }
                if *existing == DataType::Float64 && incoming_type == DataType::Int64 {
                    continue;
                }
                return Err(SchemaConflict::Retyped {
                    table: table.to_string(),
                    column: name.to_string(),
                    existing: existing.clone(),
                    incoming: incoming_type,
                });
            }
        }
    }
    Ok(evolution)
}

/// Collapse inferred types onto the small set the raw tables track.
fn normalize(data_type: &DataType) -> DataType {
    match data_type {
        DataType::Null => DataType::Null,
        DataType::Boolean => DataType::Boolean,
        t if t.is_integer() => DataType::Int64,
        t if t.is_floating() => DataType::Float64,
        _ => DataType::Utf8,
    }
}

pub fn type_name(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Null => "null",
        DataType::Boolean => "boolean",
        DataType::Int64 => "int64",
        DataType::Float64 => "float64",
        _ => "utf8",
    }
}

pub fn parse_type(name: &str) -> DataType {
    match name {
        "null" => DataType::Null,
        "boolean" => DataType::Boolean,
        "int64" => DataType::Int64,
        "float64" => DataType::Float64,
        _ => DataType::Utf8,
    }
}

/// SQLite column affinity for a tracked type. `Null` columns get none.
pub fn sql_affinity(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean | DataType::Int64 => "INTEGER",
        DataType::Float64 => "REAL",
        DataType::Null => "",
        _ => "TEXT",
    }
}
