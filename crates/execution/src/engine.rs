//! The execution engine - drives the scheduler until the run settles.

use std::sync::Arc;

use pipex_core::TaskId;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::scheduler::{Scheduler, TaskCounts, TickReport};
use crate::Result;

/// Configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Write a checkpoint every N ticks (None = after every tick that
    /// changed something)
    pub checkpoint_every: Option<u32>,
    /// Max ticks before stopping (None = until idle)
    pub max_ticks: Option<u64>,
    /// Kill the remaining tasks once the run has failed
    pub drain_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: None,
            max_ticks: None,
            drain_on_failure: true,
        }
    }
}

/// Result of a single execution cycle.
#[derive(Debug)]
pub enum CycleResult {
    /// Tasks are still pending or running
    Progress(TickReport),
    /// Nothing left to do
    Idle,
    /// A task that may not fail failed
    Failed(TaskId),
    /// The run was cancelled
    Cancelled,
}

/// Outcome of [`Engine::run_until_idle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Ticks executed
    pub ticks: u64,
    /// Final task counts
    pub counts: TaskCounts,
    /// Task that aborted the run
    pub fatal: Option<TaskId>,
    /// Tasks that ended failed, in arrival order
    pub failed_tasks: Vec<TaskId>,
    /// Run cancelled from outside
    pub cancelled: bool,
    /// Stopped by `max_ticks` with work left
    pub interrupted: bool,
}

impl RunSummary {
    /// Did the run fail as a whole?
    pub fn failed(&self) -> bool {
        self.fatal.is_some() || self.cancelled
    }
}

/// The main execution engine.
///
/// Runs the control loop:
/// ```text
/// Admit → Dispatch → Poll → Reap → Checkpoint
/// ```
pub struct Engine {
    scheduler: Arc<Scheduler>,
    checkpoints: Option<CheckpointManager>,
    config: EngineConfig,
    ticks_run: u64,
}

impl Engine {
    /// Create a new engine around `scheduler`.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            checkpoints: None,
            config: EngineConfig::default(),
            ticks_run: 0,
        }
    }

    /// Persist progress through `manager`.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared scheduler handle, for submitting and cancelling from outside.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Get ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks_run
    }

    /// Run one tick, checkpointing on the configured cadence.
    pub async fn run_cycle(&mut self) -> Result<CycleResult> {
        if self.scheduler.is_cancelled() {
            return Ok(CycleResult::Cancelled);
        }

        let report = self.scheduler.tick().await?;
        self.ticks_run += 1;
        for failure in &report.failures {
            warn!("{}", failure);
        }

        let due = match self.config.checkpoint_every {
            Some(every) => every > 0 && self.ticks_run % u64::from(every) == 0,
            None => !report.is_empty(),
        };
        if due {
            self.checkpoint().await?;
        }

        if let Some(task) = self.scheduler.fatal_task() {
            return Ok(CycleResult::Failed(task));
        }
        if self.scheduler.is_idle() {
            return Ok(CycleResult::Idle);
        }
        Ok(CycleResult::Progress(report))
    }

    /// Run ticks until nothing is left to do, the run fails, or
    /// `max_ticks` is reached. Writes a final checkpoint.
    pub async fn run_until_idle(&mut self) -> Result<RunSummary> {
        let interval = self.scheduler.tick_interval();
        info!(interval = ?interval, "engine started");

        let mut interrupted = false;
        loop {
            if let Some(max) = self.config.max_ticks {
                if self.ticks_run >= max {
                    info!("Reached max ticks ({})", max);
                    interrupted = !self.scheduler.is_idle();
                    break;
                }
            }

            match self.run_cycle().await? {
                CycleResult::Progress(report) => {
                    debug!(
                        admitted = report.admitted.len(),
                        completed = report.completed.len(),
                        "tick {}",
                        self.ticks_run
                    );
                    tokio::time::sleep(interval).await;
                }
                CycleResult::Idle => {
                    info!("No more tasks to execute");
                    break;
                }
                CycleResult::Failed(task) => {
                    error!(task = %task, "run failed");
                    if self.config.drain_on_failure {
                        let killed = self.scheduler.abort().await?;
                        info!(killed, "drained remaining tasks");
                    }
                    break;
                }
                CycleResult::Cancelled => {
                    info!("run cancelled");
                    break;
                }
            }
        }

        self.checkpoint().await?;
        Ok(self.summary(interrupted))
    }

    /// Run the engine on its own tokio task.
    pub fn spawn(mut self) -> JoinHandle<Result<RunSummary>> {
        tokio::spawn(async move { self.run_until_idle().await })
    }

    async fn checkpoint(&self) -> Result<()> {
        if let Some(manager) = &self.checkpoints {
            manager.save(&self.scheduler).await?;
        }
        Ok(())
    }

    fn summary(&self, interrupted: bool) -> RunSummary {
        let failed_tasks = self
            .scheduler
            .tasks()
            .iter()
            .filter(|t| t.is_done() && t.is_failed())
            .map(|t| t.id().clone())
            .collect();
        RunSummary {
            ticks: self.ticks_run,
            counts: self.scheduler.counts(),
            fatal: self.scheduler.fatal_task(),
            failed_tasks,
            cancelled: self.scheduler.is_cancelled(),
            interrupted,
        }
    }
}
