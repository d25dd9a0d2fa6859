//! Execution errors.

use std::time::Duration;

use pipex_core::{Resources, TaskId};
use pipex_storage::StorageError;

/// Result type for execution operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors raised by executioners, the scheduler and checkpointing.
///
/// Task-level variants (`StartFailure`, `Timeout`, `OutputContractViolation`,
/// `NonZeroExit`) describe what happened to one task and are also recorded
/// on the task itself. `Task` and `Storage` wrap engine-invariant violations
/// that must reach the operator.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The backend could not launch the task
    #[error("task {task} failed to start: {reason}")]
    StartFailure {
        /// Task
        task: TaskId,
        /// Backend message
        reason: String,
    },

    /// The request exceeds the total capacity of the pool
    #[error("task {task} requests {requested}, more than the total capacity {capacity}")]
    ResourceUnsatisfiable {
        /// Task
        task: TaskId,
        /// What the task asked for
        requested: Resources,
        /// What the pool has in total
        capacity: Resources,
    },

    /// The task exceeded its wall-clock budget and was killed
    #[error("task {task} timed out after {after:?}")]
    Timeout {
        /// Task
        task: TaskId,
        /// Configured budget
        after: Duration,
    },

    /// A declared output is missing or empty
    #[error("task {task} finished but its outputs are invalid:\n{details}")]
    OutputContractViolation {
        /// Task
        task: TaskId,
        /// One line per offending file
        details: String,
    },

    /// The task ended in an error state
    #[error("task {task} failed with exit value {exit_value}")]
    NonZeroExit {
        /// Task
        task: TaskId,
        /// Normalized exit value
        exit_value: i32,
    },

    /// A task that may not fail did, so the run is over
    #[error("run aborted: task {task} failed\n{report}")]
    RunFailed {
        /// First task that failed
        task: TaskId,
        /// Task report
        report: String,
    },

    /// The run was cancelled; no further admission
    #[error("run cancelled")]
    RunCancelled,

    /// A task with this id is already known
    #[error("task {0} already submitted")]
    DuplicateTask(TaskId),

    /// No task with this id
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// No executioner registered under this name
    #[error("unknown executioner '{0}'")]
    UnknownExecutioner(String),

    /// A restored task's backend handle cannot be resolved
    #[error("task {0} cannot be re-attached: no process handle")]
    Detached(TaskId),

    /// State machine violation (engine bug)
    #[error(transparent)]
    Task(#[from] pipex_core::Error),

    /// Checkpoint persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A background poll or start panicked or was aborted
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Engine-invariant violations, never swallowed by the control loop.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ExecError::Task(pipex_core::Error::InvalidStateTransition { .. })
                | ExecError::Task(pipex_core::Error::ExitValueConflict { .. })
                | ExecError::Storage(StorageError::CorruptCheckpoint { .. })
                | ExecError::Storage(StorageError::UnsupportedVersion { .. })
        )
    }
}
