//! Coordinator tying rules to the debouncer, pollers and pipeline.
//!
//! This is the entry point used by the CLI and integration tests:
//! - [`Monitor::handle_change`]: route one change event to every rule that
//!   watches the path (debounced).
//! - [`Monitor::start_polling`]: one periodic poller per enabled rule/folder.
//! - [`Monitor::scan_once`]: a single poller pass over everything.
//! - [`Monitor::process_now`]: run the pipeline for one file without waiting.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{MonitoringRule, ScribeConfig};
use crate::contract::{Clock, CompletionService, FileStore};
use crate::debounce::Debouncer;
use crate::matcher::matches_name;
use crate::pipeline::{Pipeline, RunReport};
use crate::poller::FolderPoller;

pub struct Monitor {
    pipeline: Arc<Pipeline>,
    debouncer: Debouncer,
    rules: Vec<Arc<MonitoringRule>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        config: &ScribeConfig,
        store: Arc<dyn FileStore>,
        service: Arc<dyn CompletionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(config, store, service, clock));
        Self::from_pipeline(pipeline, config.rules.clone())
    }

    pub fn from_pipeline(pipeline: Arc<Pipeline>, rules: Vec<MonitoringRule>) -> Self {
        Self {
            debouncer: Debouncer::new(Arc::clone(&pipeline)),
            pipeline,
            rules: rules.into_iter().map(Arc::new).collect(),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Report every debounced run on `reporter`.
    pub fn with_reporter(mut self, reporter: UnboundedSender<RunReport>) -> Self {
        self.debouncer = Debouncer::new(Arc::clone(&self.pipeline)).with_reporter(reporter);
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    fn rules_for<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a Arc<MonitoringRule>> + 'a {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.rules
            .iter()
            .filter(move |rule| rule.watches(path) && matches_name(&file_name, &rule.file_name_template))
    }

    /// Schedule debounced processing of `path` for each rule watching it.
    /// Returns the number of rules scheduled.
    /// A rule is skipped for files it wrote itself.
    pub async fn handle_change(&self, path: &Path) -> usize {
        let mut scheduled = 0;
        for rule in self.rules_for(path) {
            if self.pipeline.is_own_output(path, &rule.name).await {
                debug!(path = %path.display(), rule = %rule.name, "Change to a file this rule wrote; ignoring");
                continue;
            }
            self.debouncer.on_file_event(path, Arc::clone(rule));
            scheduled += 1;
        }
        scheduled
    }

    fn build_pollers(&self) -> Vec<FolderPoller> {
        self.rules
            .iter()
            .filter(|rule| rule.enabled)
            .flat_map(|rule| {
                rule.folders.iter().map(|folder| {
                    FolderPoller::new(Arc::clone(&self.pipeline), Arc::clone(rule), folder.clone())
                })
            })
            .collect()
    }

    pub fn start_polling(&self) {
        let mut handles = self.pollers.lock().expect("poller lock poisoned");
        for poller in self.build_pollers() {
            handles.push(poller.spawn());
        }
        info!(pollers = handles.len(), "Folder pollers started");
    }

    /// One pass of every poller, in rule order, so an output written by one
    /// rule is seen by later rules in the same pass.
    pub async fn scan_once(&self) -> Vec<RunReport> {
        let mut reports = Vec::new();
        for poller in self.build_pollers() {
            reports.extend(poller.poll_once().await);
        }
        reports
    }

    pub async fn process_now(&self, path: &Path) -> Vec<RunReport> {
        let mut reports = Vec::new();
        for rule in self.rules_for(path) {
            let outcome = self.pipeline.process_file(path, rule).await;
            reports.push(RunReport {
                rule: rule.name.clone(),
                path: path.to_path_buf(),
                outcome,
            });
        }
        reports
    }

    /// Stop pollers and drop pending debounce timers.
    pub fn shutdown(&self) {
        for handle in self.pollers.lock().expect("poller lock poisoned").drain(..) {
            handle.abort();
        }
        self.debouncer.cancel_all();
        info!("Monitor stopped");
    }
}
