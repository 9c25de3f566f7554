use std::time::Duration;

/// What started a pipeline cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fired on a fixed interval
    Interval(Duration),
    /// Started by an operator or a test
    Manual,
}

impl Trigger {
    /// Stored in `cycle_runs.trigger_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Manual => "manual",
        }
    }
}

/// An event delivered to the engine loop.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Which pipeline this event is for
    pub pipeline: String,
    pub trigger: Trigger,
}
