//! Filesystem watcher feeding change events into the core monitor.
//!
//! `notify` delivers events on its own thread; they are forwarded over an
//! unbounded channel and turned into root-relative file identities before
//! reaching [`Monitor::handle_change`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use llm_scribe_core::monitor::Monitor;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Paths in `event` that should trigger processing.
fn changed_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths.clone(),
        // Only the destination of a rename is a live file.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().cloned().into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Vec::new(),
        EventKind::Modify(_) => event.paths.clone(),
        _ => Vec::new(),
    }
}

fn to_identity(root: &Path, absolute: &Path) -> Option<PathBuf> {
    let relative = absolute.strip_prefix(root).ok()?;
    let hidden = relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    if hidden || relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative.to_path_buf())
    }
}

/// Keeps the underlying watcher alive; dropping it stops event delivery.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    forwarder: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        self.forwarder.abort();
    }
}

/// Watch `root` recursively and route every file change to `monitor`.
pub fn start_watching(root: &Path, monitor: Arc<Monitor>) -> Result<WatchHandle> {
    let root = root
        .canonicalize()
        .with_context(|| format!("vault root {} is not accessible", root.display()))?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => error!(error = ?e, "[WATCH] Watcher error"),
    })
    .context("failed to create filesystem watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    info!(root = %root.display(), "[WATCH] Watching for file changes");

    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for absolute in changed_paths(&event) {
                if !absolute.is_file() {
                    continue;
                }
                let Some(identity) = to_identity(&root, &absolute) else {
                    continue;
                };
                let scheduled = monitor.handle_change(&identity).await;
                debug!(path = %identity.display(), rules = scheduled, "[WATCH] Change dispatched");
            }
        }
    });

    Ok(WatchHandle {
        _watcher: watcher,
        forwarder,
    })
}
