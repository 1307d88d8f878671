//! Periodic folder scans that catch files the change events missed.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitoringRule;
use crate::matcher::matches_name;
use crate::pipeline::{Pipeline, RunReport};

pub struct FolderPoller {
    pipeline: Arc<Pipeline>,
    rule: Arc<MonitoringRule>,
    folder: PathBuf,
}

impl FolderPoller {
    pub fn new(pipeline: Arc<Pipeline>, rule: Arc<MonitoringRule>, folder: PathBuf) -> Self {
        Self {
            pipeline,
            rule,
            folder,
        }
    }

    /// Process every matching file in the folder that this rule has not
    /// finished with, or that changed since it did.
    pub async fn poll_once(&self) -> Vec<RunReport> {
        if !self.rule.enabled {
            return Vec::new();
        }
        let store = self.pipeline.store();
        let files = match store.list(&self.folder).await {
            Ok(files) => files,
            Err(e) => {
                warn!(folder = %self.folder.display(), rule = %self.rule.name, error = %e, "[POLL] Failed to list folder");
                return Vec::new();
            }
        };

        let mut due = Vec::new();
        for path in files {
            let name_matches = path
                .file_name()
                .is_some_and(|n| matches_name(&n.to_string_lossy(), &self.rule.file_name_template));
            if !name_matches || self.pipeline.is_own_output(&path, &self.rule.name).await {
                continue;
            }
            match store.stat(&path).await {
                Ok(meta) if self.pipeline.needs_processing(&path, &self.rule.name, meta.modified) => {
                    due.push(path)
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "[POLL] Could not stat file"),
            }
        }

        if due.is_empty() {
            return Vec::new();
        }
        info!(folder = %self.folder.display(), rule = %self.rule.name, count = due.len(), "[POLL] Files due for processing");

        let runs = due.into_iter().map(|path| async move {
            let outcome = self.pipeline.process_file(&path, &self.rule).await;
            RunReport {
                rule: self.rule.name.clone(),
                path,
                outcome,
            }
        });
        join_all(runs).await
    }

    /// Poll every `rule.poll_period()`, starting immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.rule.poll_period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reports = self.poll_once().await;
                for report in reports.iter().filter(|r| !r.outcome.is_skip()) {
                    debug!(path = %report.path.display(), outcome = ?report.outcome, "[POLL] Run finished");
                }
            }
        })
    }
}
