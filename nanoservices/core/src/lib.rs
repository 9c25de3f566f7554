//! transitflow_core: an hourly transit-data pipeline core.
//!
//! A cycle walks the metadata [`catalog`] with the [`orchestrator`] (paginated
//! fetches on a bounded worker pool, retries, failure capture), lands each page
//! immutably through [`landing`], structures new raw files with the
//! schema-evolving [`ingest`]or, folds the delta into curated tables with the
//! [`merge`] engine, joins reference data in [`enrich`] and recomputes the
//! [`aggregate`] views.
//!
//! ```no_run
//! use transitflow_core::builder::PipelineBuilder;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = PipelineBuilder::from_path("pipelines/transit.yaml")?.build()?;
//! let summary = pipeline.run_cycle("manual-1").await?;
//! println!("{}", serde_json::to_string_pretty(&summary)?);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod enrich;
pub mod events;
pub mod failures;
pub mod ingest;
pub mod landing;
pub mod merge;
pub mod orchestrator;
pub mod pipeline;
pub mod sources;
pub mod warehouse;

pub mod logging;

pub mod metrics;
