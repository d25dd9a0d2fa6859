//! pipex core data models.
//!
//! This crate defines the task model shared by the scheduler, the
//! executioners and the checkpoint codec: ids, resource descriptors, the
//! lifecycle state machine and the task itself.

#![warn(missing_docs)]

mod cleanup;
mod error;
mod id;
mod resources;
mod state;
mod task;

pub use cleanup::CleanupRegistry;
pub use error::{Error, Result};
pub use id::TaskId;
pub use resources::Resources;
pub use state::{
    ParseStateError, TaskState, EXITCODE_ERROR, EXITCODE_KILLED, EXITCODE_OK, EXITCODE_TIMEOUT,
};
pub use task::{Task, TaskSnapshot, SHEBANG};
