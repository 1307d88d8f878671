use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::contract::{Clock, FileStore, StoreError};
use crate::template::{render_log_entry, LogEntry};

/// Append-only activity log kept as a note in the file store.
///
/// The store has no append primitive, so each entry is a read-modify-write;
/// the internal lock keeps concurrent appends from losing lines.
pub struct ActivityLog {
    store: Arc<dyn FileStore>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn FileStore>, clock: Arc<dyn Clock>, path: PathBuf) -> Self {
        Self {
            store,
            clock,
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &LogEntry<'_>) -> Result<(), StoreError> {
        let line = render_log_entry(entry, &self.clock.now());
        let _guard = self.lock.lock().await;
        let existing = if self.store.exists(&self.path).await {
            self.store.read(&self.path).await?
        } else {
            String::new()
        };
        let updated = if existing.is_empty() {
            format!("{line}\n")
        } else if existing.ends_with('\n') {
            format!("{existing}{line}\n")
        } else {
            format!("{existing}\n{line}\n")
        };
        match self.store.write(&self.path, &updated).await {
            Ok(()) => {
                debug!(log = %self.path.display(), operation = %entry.operation, "Appended activity log entry");
                Ok(())
            }
            Err(e) => {
                error!(log = %self.path.display(), error = %e, "Failed to write activity log");
                Err(e)
            }
        }
    }
}
