//! Executioner abstraction: start, poll and kill tasks on one substrate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipex_core::{Task, TaskState};
use tracing::{debug, warn};

use crate::{ExecError, Result};

/// What a backend reports about a started task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Accepted but not executing yet (e.g. waiting in a cluster queue)
    Queued,
    /// Executing
    Running,
    /// Completed with a normalized exit code (0, 1, 2 or 3)
    Exited(i32),
}

/// What a backend returns after launching a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Process or job id, used to re-attach after a restart
    pub pid: Option<String>,
    /// Execution already began (a queued job is not running yet)
    pub running: bool,
}

/// Backend that runs tasks on a specific substrate.
///
/// Implementors provide the substrate operations (`launch`, `poll`,
/// `cancel`, `attach`); the provided `start` and `kill` apply the matching
/// task state transitions so every backend moves tasks the same way.
#[async_trait]
pub trait Executioner: Send + Sync {
    /// Name recorded in checkpoints to find the owner of a task again.
    fn name(&self) -> &str;

    /// Suggested polling period.
    fn monitor_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Launch an already materialized task.
    async fn launch(&self, task: &Arc<Task>) -> Result<Launched>;

    /// Non-blocking completion check.
    async fn poll(&self, task: &Task) -> Result<PollStatus>;

    /// Terminate the task's process. Must not touch the task state.
    async fn cancel(&self, task: &Task) -> Result<()>;

    /// Resume tracking a task launched by an earlier controller process.
    async fn attach(&self, task: &Arc<Task>) -> Result<()>;

    /// Materialize and launch `task`.
    ///
    /// On success the task is `Started` (and `Running` if the backend says
    /// so) with its pid recorded. On failure it is `StartFailed` and a
    /// `StartFailure` is returned; there is no retry. A task killed while
    /// its launch was in flight stays `Killed` and the launched process is
    /// cancelled.
    async fn start(&self, task: &Arc<Task>) -> Result<()> {
        if task.is_done() {
            debug!(task = %task.id(), "killed before launch");
            return Ok(());
        }
        let launched = match task.materialize() {
            Ok(()) => self.launch(task).await,
            Err(e) => Err(ExecError::from(e)),
        };

        match launched {
            Ok(launched) => {
                if let Some(pid) = launched.pid {
                    task.set_pid(pid);
                }
                let mut recorded = task.record_state(TaskState::Started);
                if recorded.is_ok() && launched.running {
                    recorded = task.record_state(TaskState::Running);
                }
                if let Err(e) = recorded {
                    if !task.is_done() {
                        return Err(e.into());
                    }
                    warn!(task = %task.id(), executioner = self.name(), "killed while launching");
                    if let Err(e) = self.cancel(task).await {
                        warn!(task = %task.id(), "cancel failed: {}", e);
                    }
                    return Ok(());
                }
                debug!(task = %task.id(), executioner = self.name(), "task started");
                Ok(())
            }
            Err(e) if e.is_invariant_violation() => Err(e),
            Err(e) => {
                if let Err(recorded) = task.record_state(TaskState::StartFailed) {
                    if task.is_done() {
                        debug!(task = %task.id(), "killed before its launch failed");
                        return Ok(());
                    }
                    return Err(recorded.into());
                }
                warn!(task = %task.id(), executioner = self.name(), "start failed: {}", e);
                Err(ExecError::StartFailure {
                    task: task.id().clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cancel `task` and mark it `Killed`. A terminal task is left alone and
    /// `false` is returned.
    async fn kill(&self, task: &Task) -> Result<bool> {
        if task.is_done() {
            return Ok(false);
        }
        let was_started = task.is_started();
        if was_started {
            if let Err(e) = self.cancel(task).await {
                warn!(task = %task.id(), "cancel failed: {}", e);
            }
        }
        let killed = task.mark_killed()?;
        // A launch that completed in the meantime left a process behind.
        if killed && !was_started && task.pid().is_some() {
            if let Err(e) = self.cancel(task).await {
                warn!(task = %task.id(), "cancel failed: {}", e);
            }
        }
        Ok(killed)
    }
}
