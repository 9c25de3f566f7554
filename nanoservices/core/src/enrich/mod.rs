pub mod resolver;

pub use resolver::{enrich_rows, EnrichedRow, EnrichmentReport, EnrichmentResolver, Snapshots};
