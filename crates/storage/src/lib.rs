//! Checkpoint persistence for pipex.
//!
//! This crate provides the versioned, line-oriented checkpoint format and a
//! trait-based store with a file reference implementation.

#![warn(missing_docs)]

pub mod codec;
pub mod file_store;
pub mod record;
pub mod trait_;

pub use file_store::{FileCheckpointStore, MemoryCheckpointStore};
pub use record::{Checkpoint, Decoder, Record, RecordRegistry, CURRENT_VERSION};
pub use trait_::{CheckpointStore, Result, StorageError};
