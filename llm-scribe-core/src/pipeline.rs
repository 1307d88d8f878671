//! Per-file processing pipeline.
//!
//! One invocation of [`Pipeline::process_file`] walks a single file through:
//! name match → in-flight check → read → content filter → queued completion →
//! optional structural template → output placement → activity log →
//! optional source deletion.
//!
//! # Invariants
//! - A file identity is processed by at most one invocation at a time. The
//!   in-flight set is checked and updated under one lock with no await in
//!   between, and the entry is released by a drop guard on every exit path.
//! - Nothing is logged or deleted unless an output file was written.
//! - A (file, rule) pair counts as processed only after a run finished with
//!   an output or a content-filter miss; failed runs stay due.
//! - A rule never consumes a file it wrote itself while that file is
//!   unchanged. Other rules may, so rules can be chained.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use crate::activity_log::ActivityLog;
use crate::completion::CompletionAdapter;
use crate::config::{CompletionFailurePolicy, MonitoringRule, OutputFileHandling, ScribeConfig};
use crate::contract::{
    Clock, CompletionError, CompletionService, ConcatTemplateRenderer, FileStore, StoreError,
    TemplateRenderer,
};
use crate::matcher::{matches_content, matches_name};
use crate::queue::RequestQueue;
use crate::template::{render_output_name, LogEntry, LogOperation};

/// How a single pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    RuleDisabled,
    NameMismatch,
    ContentMismatch,
    AlreadyProcessing,
    OwnOutput,
    SourceMissing,
    ReadFailed(String),
    CompletionFailed(CompletionError),
    WriteFailed(String),
    Done {
        output: PathBuf,
        source_deleted: bool,
    },
}

impl ProcessOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ProcessOutcome::Done { .. })
    }

    /// True for the silent skips: filters, disabled rules, concurrency and
    /// self-written files.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::RuleDisabled
                | ProcessOutcome::NameMismatch
                | ProcessOutcome::ContentMismatch
                | ProcessOutcome::AlreadyProcessing
                | ProcessOutcome::OwnOutput
        )
    }
}

/// One pipeline run, as reported by the debouncer, poller and monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub rule: String,
    pub path: PathBuf,
    pub outcome: ProcessOutcome,
}

/// Removes its path from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.path);
        }
    }
}

/// An output written by a rule. `modified` is `None` while the write is in
/// progress.
#[derive(Debug, Clone)]
struct WrittenRecord {
    rule: String,
    modified: Option<SystemTime>,
}

type StampKey = (PathBuf, String);

pub struct Pipeline {
    store: Arc<dyn FileStore>,
    queue: RequestQueue,
    clock: Arc<dyn Clock>,
    renderer: Arc<dyn TemplateRenderer>,
    log: ActivityLog,
    failure_policy: CompletionFailurePolicy,
    in_flight: Mutex<HashSet<PathBuf>>,
    last_processed: Mutex<HashMap<StampKey, SystemTime>>,
    written: Mutex<HashMap<PathBuf, WrittenRecord>>,
}

impl Pipeline {
    pub fn new(
        config: &ScribeConfig,
        store: Arc<dyn FileStore>,
        service: Arc<dyn CompletionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let adapter = CompletionAdapter::new(service, Arc::clone(&store), config.request_timeout);
        let queue = RequestQueue::new(adapter, config.request_interval);
        let log = ActivityLog::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.log_file.clone(),
        );
        Self {
            store,
            queue,
            clock,
            renderer: Arc::new(ConcatTemplateRenderer),
            log,
            failure_policy: config.on_completion_failure,
            in_flight: Mutex::new(HashSet::new()),
            last_processed: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default concatenating template renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .contains(path)
    }

    /// True for the activity log, and for an output `rule_name` wrote that
    /// has not been modified since. A record whose file changed is dropped.
    pub async fn is_own_output(&self, path: &Path, rule_name: &str) -> bool {
        if path == self.log.path() {
            return true;
        }
        let record = self
            .written
            .lock()
            .expect("written-set lock poisoned")
            .get(path)
            .cloned();
        let Some(record) = record else {
            return false;
        };
        if record.rule != rule_name {
            return false;
        }
        let Some(written_at) = record.modified else {
            return true;
        };
        match self.store.stat(path).await {
            Ok(meta) if meta.modified == written_at => true,
            _ => {
                let mut written = self.written.lock().expect("written-set lock poisoned");
                if written
                    .get(path)
                    .is_some_and(|current| current.modified == Some(written_at))
                {
                    written.remove(path);
                    debug!(path = %path.display(), "[PIPELINE] Output changed since it was written; forgetting it");
                }
                false
            }
        }
    }

    /// True if `rule_name` has not finished with `path` yet, or the file was
    /// modified after the modification time seen on that run.
    pub fn needs_processing(&self, path: &Path, rule_name: &str, modified: SystemTime) -> bool {
        match self
            .last_processed
            .lock()
            .expect("last-processed lock poisoned")
            .get(&(path.to_path_buf(), rule_name.to_string()))
        {
            Some(seen) => modified > *seen,
            None => true,
        }
    }

    fn stamp(&self, path: &Path, rule_name: &str, modified: SystemTime) {
        self.last_processed
            .lock()
            .expect("last-processed lock poisoned")
            .insert((path.to_path_buf(), rule_name.to_string()), modified);
    }

    fn forget_stamps(&self, path: &Path) {
        self.last_processed
            .lock()
            .expect("last-processed lock poisoned")
            .retain(|(stamped, _), _| stamped != path);
    }

    fn try_begin(&self, path: &Path) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().expect("in-flight lock poisoned");
        if !set.insert(path.to_path_buf()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            path: path.to_path_buf(),
        })
    }

    pub async fn process_file(&self, path: &Path, rule: &MonitoringRule) -> ProcessOutcome {
        if !rule.enabled {
            return ProcessOutcome::RuleDisabled;
        }
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return ProcessOutcome::NameMismatch,
        };
        if !matches_name(&file_name, &rule.file_name_template) {
            debug!(path = %path.display(), rule = %rule.name, "[PIPELINE] Name does not match");
            return ProcessOutcome::NameMismatch;
        }
        if self.is_own_output(path, &rule.name).await {
            debug!(path = %path.display(), rule = %rule.name, "[PIPELINE] Ignoring file written by this rule");
            return ProcessOutcome::OwnOutput;
        }
        let Some(_guard) = self.try_begin(path) else {
            debug!(path = %path.display(), rule = %rule.name, "[PIPELINE] Already processing; skipping");
            return ProcessOutcome::AlreadyProcessing;
        };

        if !self.store.exists(path).await {
            warn!(path = %path.display(), rule = %rule.name, "[PIPELINE] Source vanished before processing");
            return ProcessOutcome::SourceMissing;
        }
        let seen = match self.store.stat(path).await {
            Ok(meta) => Some(meta.modified),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "[PIPELINE] Could not stat source");
                None
            }
        };
        let content = match self.store.read(path).await {
            Ok(content) => content,
            Err(StoreError::NotFound(_)) => {
                warn!(path = %path.display(), "[PIPELINE] Source vanished while reading");
                return ProcessOutcome::SourceMissing;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "[PIPELINE] Failed to read source");
                return ProcessOutcome::ReadFailed(e.to_string());
            }
        };
        if !matches_content(&content, &rule.content_regex) {
            debug!(path = %path.display(), rule = %rule.name, "[PIPELINE] Content filter did not match");
            if let Some(seen) = seen {
                self.stamp(path, &rule.name, seen);
            }
            return ProcessOutcome::ContentMismatch;
        }

        info!(path = %path.display(), rule = %rule.name, "[PIPELINE] Queueing completion");
        let generated = match self.queue.enqueue(content, rule.prompt.clone()).await {
            Ok(text) => text,
            Err(e) => match self.failure_policy {
                CompletionFailurePolicy::Abort => {
                    error!(path = %path.display(), rule = %rule.name, error = %e, "[PIPELINE] Completion failed; aborting");
                    return ProcessOutcome::CompletionFailed(e);
                }
                CompletionFailurePolicy::EmbedError => {
                    warn!(path = %path.display(), rule = %rule.name, error = %e, "[PIPELINE] Completion failed; writing error as output");
                    format!("Error processing file: {e}")
                }
            },
        };

        let content = self.apply_template(rule, generated).await;
        let output = match self.save_processed_content(path, rule, &content).await {
            Ok(output) => output,
            Err(e) => {
                error!(path = %path.display(), rule = %rule.name, error = %e, "[PIPELINE] Failed to write output");
                return ProcessOutcome::WriteFailed(e.to_string());
            }
        };
        let rewritten_in_place = output == path;
        if rewritten_in_place {
            // The rewrite itself must not make the source due again.
            match self.store.stat(path).await {
                Ok(meta) => self.stamp(path, &rule.name, meta.modified),
                Err(_) => {
                    if let Some(seen) = seen {
                        self.stamp(path, &rule.name, seen);
                    }
                }
            }
        } else if let Some(seen) = seen {
            self.stamp(path, &rule.name, seen);
        }
        info!(source = %path.display(), output = %output.display(), rule = %rule.name, "[PIPELINE] Output written");

        self.log_operation(LogOperation::Process, path, Some(&output), rule)
            .await;

        let source_deleted = if !rule.delete_source_file {
            false
        } else if rewritten_in_place {
            warn!(path = %path.display(), rule = %rule.name, "[PIPELINE] Output replaced the source; not deleting it");
            false
        } else {
            self.delete_source(path, rule).await
        };
        ProcessOutcome::Done {
            output,
            source_deleted,
        }
    }

    async fn apply_template(&self, rule: &MonitoringRule, generated: String) -> String {
        let Some(template_path) = &rule.template_file else {
            return generated;
        };
        if !self.store.exists(template_path).await {
            debug!(template = %template_path.display(), "[PIPELINE] Template file missing; using plain output");
            return generated;
        }
        match self.store.read(template_path).await {
            Ok(template) => self.renderer.combine(&template, &generated),
            Err(e) => {
                debug!(template = %template_path.display(), error = %e, "[PIPELINE] Template unreadable; using plain output");
                generated
            }
        }
    }

    /// Write `content` to the rule's output location for `source` and return
    /// the path actually used. The output may be the source itself.
    pub async fn save_processed_content(
        &self,
        source: &Path,
        rule: &MonitoringRule,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = render_output_name(&file_name, &rule.output_file_name_template, &self.clock.now());
        let base = source.parent().unwrap_or_else(|| Path::new("")).join(name);

        if !self.store.exists(&base).await {
            return self.write_output(&base, source, rule, content).await;
        }
        match rule.output_file_handling {
            OutputFileHandling::Overwrite => self.write_output(&base, source, rule, content).await,
            OutputFileHandling::Append => {
                let existing = self.store.read(&base).await?;
                self.write_output(&base, source, rule, &format!("{existing}\n{content}"))
                    .await
            }
            OutputFileHandling::Rename => {
                let target = self.first_unused_variant(&base).await;
                self.write_output(&target, source, rule, content).await
            }
        }
    }

    /// Write `target` and, unless it is the source, remember it as this
    /// rule's output together with its modification time after the write.
    async fn write_output(
        &self,
        target: &Path,
        source: &Path,
        rule: &MonitoringRule,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        if target == source {
            self.store.write(target, content).await?;
            return Ok(target.to_path_buf());
        }

        // Marked in progress so change events racing the write are ignored.
        let previous = self.written.lock().expect("written-set lock poisoned").insert(
            target.to_path_buf(),
            WrittenRecord {
                rule: rule.name.clone(),
                modified: None,
            },
        );
        if let Err(e) = self.store.write(target, content).await {
            let mut written = self.written.lock().expect("written-set lock poisoned");
            match previous {
                Some(previous) => written.insert(target.to_path_buf(), previous),
                None => written.remove(target),
            };
            return Err(e);
        }

        let modified = self.store.stat(target).await.ok().map(|meta| meta.modified);
        let mut written = self.written.lock().expect("written-set lock poisoned");
        match modified {
            Some(modified) => {
                written.insert(
                    target.to_path_buf(),
                    WrittenRecord {
                        rule: rule.name.clone(),
                        modified: Some(modified),
                    },
                );
            }
            None => {
                debug!(path = %target.display(), "[PIPELINE] Could not stat new output; not tracking it");
                written.remove(target);
            }
        }
        Ok(target.to_path_buf())
    }

    /// `name_1.md`, `name_2.md`, ... : the first that does not exist.
    async fn first_unused_variant(&self, base: &Path) -> PathBuf {
        let parent = base.parent().unwrap_or_else(|| Path::new(""));
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = base
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1u32;
        loop {
            let candidate = parent.join(format!("{stem}_{counter}{extension}"));
            if !self.store.exists(&candidate).await {
                return candidate;
            }
            counter += 1;
        }
    }

    async fn delete_source(&self, path: &Path, rule: &MonitoringRule) -> bool {
        if !self.store.exists(path).await {
            info!(path = %path.display(), "[PIPELINE] Source already removed; nothing to delete");
            return false;
        }
        match self.store.delete(path).await {
            Ok(()) => {
                info!(path = %path.display(), rule = %rule.name, "[PIPELINE] Deleted source file");
                self.forget_stamps(path);
                self.log_operation(LogOperation::Delete, path, None, rule)
                    .await;
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "[PIPELINE] Failed to delete source file");
                false
            }
        }
    }

    async fn log_operation(
        &self,
        operation: LogOperation,
        source: &Path,
        output: Option<&Path>,
        rule: &MonitoringRule,
    ) {
        let entry = LogEntry {
            operation,
            source,
            output,
            rule_name: &rule.name,
            output_template: &rule.output_file_name_template,
            prompt: &rule.prompt,
        };
        if let Err(e) = self.log.append(&entry).await {
            warn!(error = %e, "[PIPELINE] Activity log entry was not written");
        }
    }
}
