//! [`FileStore`] implementations: a directory on disk and an in-memory map.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use crate::contract::{FileMeta, FileStore, StoreError};

/// Files under a root directory. File identities are root-relative paths.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, StoreError> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(StoreError::Other(format!(
                "path escapes store root: {}",
                path.display()
            )));
        }
        Ok(self.root.join(path))
    }

    /// Convert an absolute path under the root into a file identity.
    pub fn relativize(&self, absolute: &Path) -> Option<PathBuf> {
        absolute.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list(&self, prefix: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let start = self.resolve(prefix)?;
        let mut results = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                if file_type.is_dir() {
                    let hidden = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'));
                    if hidden {
                        debug!(path = %path.display(), "Skipping hidden directory");
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(relative) = self.relativize(&path) {
                        results.push(relative);
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }

    async fn exists(&self, path: &Path) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::metadata(full)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read(&self, path: &Path) -> Result<String, StoreError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn write(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn stat(&self, path: &Path) -> Result<FileMeta, StoreError> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let modified = metadata.modified().map_err(|e| StoreError::io(path, e))?;
        Ok(FileMeta { modified })
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    content: String,
    modified: SystemTime,
}

/// An in-process store. Reads can be slowed down to widen race windows.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<PathBuf, MemoryFile>>,
    read_delay: Option<Duration>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Insert a file without going through the async API.
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.lock().expect("store lock poisoned").insert(
            path.into(),
            MemoryFile {
                content: content.into(),
                modified: SystemTime::now(),
            },
        );
    }

    pub fn set_modified(&self, path: &Path, modified: SystemTime) {
        if let Some(file) = self.files.lock().expect("store lock poisoned").get_mut(path) {
            file.modified = modified;
        }
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.files
            .lock()
            .expect("store lock poisoned")
            .get(path)
            .map(|f| f.content.clone())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn list(&self, prefix: &Path) -> Result<Vec<PathBuf>, StoreError> {
        Ok(self
            .files
            .lock()
            .expect("store lock poisoned")
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files
            .lock()
            .expect("store lock poisoned")
            .contains_key(path)
    }

    async fn read(&self, path: &Path) -> Result<String, StoreError> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    async fn write(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        self.insert(path, content);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.files
            .lock()
            .expect("store lock poisoned")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    async fn stat(&self, path: &Path) -> Result<FileMeta, StoreError> {
        self.files
            .lock()
            .expect("store lock poisoned")
            .get(path)
            .map(|f| FileMeta {
                modified: f.modified,
            })
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }
}
