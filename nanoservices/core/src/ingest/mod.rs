pub mod ingestor;
pub mod schema;

pub use ingestor::{IngestReport, SchemaEvolvingIngestor};
pub use schema::{Evolution, FlattenCollision, SchemaConflict};
