//! Incremental merge: raw delta in, deduplicated curated upsert out.

pub mod dedup;
pub mod engine;
pub mod record;
pub mod validate;

pub use dedup::CycleSurvivors;
pub use engine::{plan_batch, MergeEngine, MergePhase, MergePlan, MergeReport, MergeSettings, TableLocks};
pub use record::{CuratedRecord, Curation, Lineage, NaturalKey};
pub use validate::{RejectReason, Rejections, TimeBounds};
