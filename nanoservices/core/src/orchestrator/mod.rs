pub mod retry;
pub mod runner;
pub mod task;

pub use retry::RetryPolicy;
pub use runner::{IngestionReport, Orchestrator, OrchestratorSettings};
pub use task::{FetchTask, TaskContext, TaskOutcome};
