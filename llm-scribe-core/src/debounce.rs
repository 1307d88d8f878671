//! Per (file, rule) debouncing of change events.
//!
//! Each key has at most one pending timer. A new event for the key aborts the
//! pending timer and starts a fresh one of `rule.delay` seconds. Each timer
//! carries a generation number and only fires if it is still the registered
//! generation when it wakes, so a superseded timer that was already past its
//! sleep can never fire as well.
//!
//! A timer that fires while another rule is still processing the same file
//! is armed again, so no rule's run is lost to the in-flight check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MonitoringRule;
use crate::pipeline::{Pipeline, ProcessOutcome, RunReport};

type DebounceKey = (PathBuf, String);

/// Lower bound on the delay before a run blocked by another rule is retried.
const RETRY_FLOOR: Duration = Duration::from_secs(1);

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    pending: HashMap<DebounceKey, PendingTimer>,
}

struct DebounceState {
    pipeline: Arc<Pipeline>,
    timers: Mutex<TimerTable>,
    reporter: Option<UnboundedSender<RunReport>>,
}

pub struct Debouncer {
    state: Arc<DebounceState>,
}

impl Debouncer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            state: Arc::new(DebounceState {
                pipeline,
                timers: Mutex::new(TimerTable::default()),
                reporter: None,
            }),
        }
    }

    /// Send a [`RunReport`] for every pipeline run a timer triggers.
    pub fn with_reporter(self, reporter: UnboundedSender<RunReport>) -> Self {
        Self {
            state: Arc::new(DebounceState {
                pipeline: Arc::clone(&self.state.pipeline),
                timers: Mutex::new(TimerTable::default()),
                reporter: Some(reporter),
            }),
        }
    }

    /// Number of timers currently waiting to fire.
    pub fn pending(&self) -> usize {
        self.state
            .timers
            .lock()
            .expect("timer lock poisoned")
            .pending
            .len()
    }

    pub fn on_file_event(&self, path: &Path, rule: Arc<MonitoringRule>) {
        let key: DebounceKey = (path.to_path_buf(), rule.name.clone());
        let mut table = self.state.timers.lock().expect("timer lock poisoned");

        if let Some(previous) = table.pending.remove(&key) {
            previous.handle.abort();
            debug!(path = %path.display(), rule = %rule.name, "[DEBOUNCE] Restarting timer");
        } else {
            debug!(path = %path.display(), rule = %rule.name, delay = rule.delay, "[DEBOUNCE] Starting timer");
        }

        let delay = rule.delay();
        arm_locked(&self.state, &mut table, key, rule, delay);
    }

    /// Abort every pending timer.
    pub fn cancel_all(&self) {
        let mut table = self.state.timers.lock().expect("timer lock poisoned");
        for (_, timer) in table.pending.drain() {
            timer.handle.abort();
        }
    }
}

/// Register a fresh timer for `key`. The caller holds the table lock.
fn arm_locked(
    state: &Arc<DebounceState>,
    table: &mut TimerTable,
    key: DebounceKey,
    rule: Arc<MonitoringRule>,
    delay: Duration,
) {
    table.next_generation += 1;
    let generation = table.next_generation;
    let handle = tokio::spawn(fire(Arc::clone(state), key.clone(), generation, rule, delay));
    table.pending.insert(key, PendingTimer { generation, handle });
}

fn fire(
    state: Arc<DebounceState>,
    key: DebounceKey,
    generation: u64,
    rule: Arc<MonitoringRule>,
    delay: Duration,
) -> BoxFuture<'static, ()> {
    async move {
        tokio::time::sleep(delay).await;

        {
            let mut table = state.timers.lock().expect("timer lock poisoned");
            match table.pending.get(&key) {
                Some(timer) if timer.generation == generation => {
                    table.pending.remove(&key);
                }
                _ => return,
            }
        }

        let (path, rule_name) = key;
        let store = state.pipeline.store();
        if !store.exists(&path).await {
            debug!(path = %path.display(), rule = %rule_name, "[DEBOUNCE] File gone before timer fired; dropping");
            return;
        }
        // Events raised by the rule's own in-place rewrite land here.
        if let Ok(meta) = store.stat(&path).await {
            if !state.pipeline.needs_processing(&path, &rule_name, meta.modified) {
                debug!(path = %path.display(), rule = %rule_name, "[DEBOUNCE] Unchanged since last run; dropping");
                return;
            }
        }

        info!(path = %path.display(), rule = %rule_name, "[DEBOUNCE] Quiet period elapsed; processing");
        let outcome = state.pipeline.process_file(&path, &rule).await;

        if outcome == ProcessOutcome::AlreadyProcessing {
            let key: DebounceKey = (path, rule_name);
            let mut table = state.timers.lock().expect("timer lock poisoned");
            if !table.pending.contains_key(&key) {
                debug!(path = %key.0.display(), rule = %key.1, "[DEBOUNCE] File busy; retrying later");
                let retry = rule.delay().max(RETRY_FLOOR);
                arm_locked(&state, &mut table, key, rule, retry);
            }
            return;
        }

        if let Some(reporter) = &state.reporter {
            let _ = reporter.send(RunReport {
                rule: rule_name,
                path,
                outcome,
            });
        }
    }
    .boxed()
}
