pub mod interval;
pub mod trigger;

pub use interval::spawn_interval_trigger;
pub use trigger::{Trigger, TriggerEvent};
