//! File and in-memory checkpoint stores.
//!
//! The file store writes the whole checkpoint to a sibling temp file and
//! renames it over the previous one, so a crash mid-write leaves the last
//! good checkpoint in place.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Checkpoint, CheckpointStore, RecordRegistry, Result};

/// Checkpoint kept in a single file.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    registry: RecordRegistry,
}

impl FileCheckpointStore {
    /// Store at `path`, decoding with the default record registry.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_registry(path, RecordRegistry::default())
    }

    /// Store at `path` with a custom record registry.
    pub fn with_registry(path: impl AsRef<Path>, registry: RecordRegistry) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            registry,
        }
    }

    /// Checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let text = checkpoint.encode();
        let tmp = self.tmp_path();
        fs::write(&tmp, text.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(
            "saved {} task(s) to {}",
            checkpoint.tasks.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(Checkpoint::decode(&text, &self.registry)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        fs::remove_file(&self.path).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Checkpoint kept in memory, encoded exactly as on disk. Used in tests and
/// by embedders that ship checkpoints elsewhere themselves.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    text: Mutex<Option<String>>,
    registry: RecordRegistry,
}

impl MemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw encoded checkpoint, if one was saved.
    pub async fn raw(&self) -> Option<String> {
        self.text.lock().await.clone()
    }

    /// Replace the raw encoded checkpoint.
    pub async fn set_raw(&self, text: impl Into<String>) {
        *self.text.lock().await = Some(text.into());
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.text.lock().await = Some(checkpoint.encode());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        match self.text.lock().await.as_deref() {
            Some(text) => Ok(Some(Checkpoint::decode(text, &self.registry)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<()> {
        *self.text.lock().await = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
