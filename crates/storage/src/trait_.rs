//! Checkpoint store abstraction.

use async_trait::async_trait;

use crate::record::Checkpoint;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded
    #[error("corrupt checkpoint at line {line}: {reason}")]
    CorruptCheckpoint {
        /// 1-based line number
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Checkpoint written by a newer format version
    #[error("unsupported checkpoint version {found} (newest known is {supported})")]
    UnsupportedVersion {
        /// Version found in the header
        found: u32,
        /// Newest version this build reads
        supported: u32,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Durable home for checkpoints.
///
/// This trait allows different storage backends to be plugged in.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the stored checkpoint, if any.
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Remove the stored checkpoint.
    async fn clear(&self) -> Result<()>;

    /// Where the checkpoint lives, for log messages.
    fn describe(&self) -> String;
}
