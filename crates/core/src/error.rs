//! Errors raised by the task model.

use crate::{TaskId, TaskState};

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a task.
///
/// Both state errors are engine bugs rather than task failures: callers
/// propagate them to the top level instead of recording them on the task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transition outside the task state machine was requested.
    #[error("task {task}: cannot jump from state '{from}' to state '{to}'")]
    InvalidStateTransition {
        /// Task being mutated
        task: TaskId,
        /// Current state
        from: TaskState,
        /// Requested state
        to: TaskState,
    },

    /// An exit value was reported twice with different codes.
    #[error("task {task}: exit value already set to {current}, refusing {requested}")]
    ExitValueConflict {
        /// Task being mutated
        task: TaskId,
        /// Recorded exit value
        current: i32,
        /// Newly reported exit value
        requested: i32,
    },

    /// Filesystem error while materializing task artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
