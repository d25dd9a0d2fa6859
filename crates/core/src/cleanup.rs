//! Files scheduled for deletion when the controlling process exits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Registry of temporary files.
///
/// Deletion is best-effort: it runs on [`CleanupRegistry::cleanup`] or when
/// the last handle is dropped, and missing files are ignored.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    paths: Mutex<Vec<PathBuf>>,
}

impl CleanupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `path` for deletion.
    pub fn register(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut paths = self.inner.lock();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Nothing registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every registered file now. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let paths = std::mem::take(&mut *self.inner.lock());
        remove_all(&paths)
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let paths = std::mem::take(self.paths.get_mut().unwrap_or_else(|e| e.into_inner()));
        remove_all(&paths);
    }
}

fn remove_all(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("could not remove {}: {}", path.display(), e),
        }
    }
    removed
}
