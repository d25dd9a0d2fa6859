//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process finished OK.
pub const EXITCODE_OK: i32 = 0;
/// Process failed.
pub const EXITCODE_ERROR: i32 = 1;
/// Process exceeded its wall-clock budget.
pub const EXITCODE_TIMEOUT: i32 = 2;
/// Process was killed.
pub const EXITCODE_KILLED: i32 = 3;

/// Lifecycle state of a task.
///
/// ```text
/// None ──► Started ──► Running ──► Finished | Error | ErrorTimeout | Killed
///   │         │
///   │         └──────────────────► Killed
///   ├──► StartFailed
///   └──► Killed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, nothing happened so far
    #[default]
    None,
    /// Process started (or queued on the backend)
    Started,
    /// Process failed to start (or failed to queue)
    StartFailed,
    /// Running OK
    Running,
    /// Failed while running
    Error,
    /// Failed due to timeout
    ErrorTimeout,
    /// Killed
    Killed,
    /// Finished OK
    Finished,
}

impl TaskState {
    /// All states, in declaration order.
    pub const ALL: [TaskState; 8] = [
        TaskState::None,
        TaskState::Started,
        TaskState::StartFailed,
        TaskState::Running,
        TaskState::Error,
        TaskState::ErrorTimeout,
        TaskState::Killed,
        TaskState::Finished,
    ];

    /// Map a normalized process exit code onto a terminal state.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            EXITCODE_OK => TaskState::Finished,
            EXITCODE_ERROR => TaskState::Error,
            EXITCODE_TIMEOUT => TaskState::ErrorTimeout,
            EXITCODE_KILLED => TaskState::Killed,
            _ => TaskState::Error,
        }
    }

    /// Is there no way out of this state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::StartFailed
                | TaskState::Error
                | TaskState::ErrorTimeout
                | TaskState::Killed
                | TaskState::Finished
        )
    }

    /// Any error or killed state.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TaskState::StartFailed | TaskState::Error | TaskState::ErrorTimeout | TaskState::Killed
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match next {
            Started | StartFailed => self == None,
            Running => self == Started,
            Finished | Error | ErrorTimeout => self == Running,
            Killed => matches!(self, None | Started | Running),
            None => false,
        }
    }

    /// Wire name used in checkpoints and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::None => "NONE",
            TaskState::Started => "STARTED",
            TaskState::StartFailed => "START_FAILED",
            TaskState::Running => "RUNNING",
            TaskState::Error => "ERROR",
            TaskState::ErrorTimeout => "ERROR_TIMEOUT",
            TaskState::Killed => "KILLED",
            TaskState::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state '{0}'")]
pub struct ParseStateError(pub String);

impl FromStr for TaskState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}
