//! Execution layer - executioners, admission control, scheduling and
//! checkpoint/resume.

#![warn(missing_docs)]

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod executioner;
pub mod local;
pub mod pool;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use checkpoint::CheckpointManager;
pub use engine::{CycleResult, Engine, EngineConfig, RunSummary};
pub use error::{ExecError, Result};
pub use executioner::{Executioner, Launched, PollStatus};
pub use local::{normalize_exit_code, LocalExecutioner, LOCAL};
pub use pool::ResourcePool;
pub use scheduler::{Scheduler, SchedulerConfig, TaskCounts, TickReport};
