mod supervisor;
pub mod watchdog;

pub use supervisor::{retention_sweep, StreamSupervisor};
