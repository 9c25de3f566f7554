pub use transitflow_core as core;
pub use transitflow_utils as utils;

// Convenience re-exports for common usage
pub use transitflow_core::builder::{BuildError, PipelineBuilder};
pub use transitflow_core::engine::TransitFlow;
pub use transitflow_core::events::trigger::Trigger;
pub use transitflow_core::failures::{FailureRecord, FailureSink};
pub use transitflow_core::landing::RawLanding;
pub use transitflow_core::pipeline::{CycleStatus, CycleSummary, Pipeline};
pub use transitflow_core::sources::{KeyLookup, Upstream};
pub use transitflow_utils::{TransitFlowResult, RowMap};
