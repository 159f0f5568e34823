pub mod finalize;
mod trigger;

pub use trigger::{ManualError, TriggerHandler, TriggerOutcome};
