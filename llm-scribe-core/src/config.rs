use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LOG_FILE: &str = "llm-scribe-log.md";
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "{{filename}}_processed";
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// What to do when an output file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFileHandling {
    #[default]
    Overwrite,
    Append,
    Rename,
}

/// What the pipeline does when a completion fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFailurePolicy {
    /// No output, no log entry, no deletion.
    #[default]
    Abort,
    /// Write a description of the failure as the processed content.
    EmbedError,
}

/// A user-defined policy: which files to watch and how to transform them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path prefixes, relative to the store root.
    #[serde(default)]
    pub folders: Vec<PathBuf>,
    /// Debounce and poll interval, in seconds.
    #[serde(default)]
    pub delay: u64,
    pub file_name_template: String,
    /// Empty means no content filter.
    #[serde(default)]
    pub content_regex: String,
    pub prompt: String,
    #[serde(default)]
    pub template_file: Option<PathBuf>,
    #[serde(default = "default_output_template")]
    pub output_file_name_template: String,
    #[serde(default)]
    pub output_file_handling: OutputFileHandling,
    #[serde(default)]
    pub delete_source_file: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_output_template() -> String {
    DEFAULT_OUTPUT_TEMPLATE.to_string()
}

impl MonitoringRule {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    /// Poll period: the rule's delay, never below one second.
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.delay.max(1))
    }

    /// True if the rule is enabled and `path` lies under one of its folders.
    pub fn watches(&self, path: &Path) -> bool {
        self.enabled && self.folders.iter().any(|folder| path.starts_with(folder))
    }

    pub fn trace_loaded(&self) {
        info!(
            rule = %self.name,
            enabled = self.enabled,
            folders = ?self.folders,
            delay = self.delay,
            file_name_template = %self.file_name_template,
            handling = ?self.output_file_handling,
            "Loaded monitoring rule"
        );
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule '{rule}' has an invalid content_regex: {source}")]
    InvalidContentRegex {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule at position {0} has an empty name")]
    EmptyRuleName(usize),
}

/// Everything the core needs to run: rules, log location, queue pacing.
#[derive(Debug, Clone)]
pub struct ScribeConfig {
    pub rules: Vec<MonitoringRule>,
    /// Activity log path, relative to the store root.
    pub log_file: PathBuf,
    pub request_interval: Duration,
    pub request_timeout: Duration,
    pub on_completion_failure: CompletionFailurePolicy,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            request_interval: DEFAULT_REQUEST_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            on_completion_failure: CompletionFailurePolicy::default(),
        }
    }
}

impl ScribeConfig {
    /// Trims rule names, checks every content regex compiles and warns on
    /// duplicate names.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter_mut().enumerate() {
            rule.name = rule.name.trim().to_string();
            if rule.name.is_empty() {
                return Err(ConfigError::EmptyRuleName(index));
            }
            if !rule.content_regex.trim().is_empty() {
                regex::Regex::new(&rule.content_regex).map_err(|source| {
                    ConfigError::InvalidContentRegex {
                        rule: rule.name.clone(),
                        source,
                    }
                })?;
            }
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if self.rules[..index].iter().any(|r| r.name == rule.name) {
                warn!(rule = %rule.name, "Duplicate rule name; debounce timers are keyed by name");
            }
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            rules_count = self.rules.len(),
            log_file = %self.log_file.display(),
            request_interval = ?self.request_interval,
            policy = ?self.on_completion_failure,
            "Loaded ScribeConfig"
        );
        for rule in &self.rules {
            rule.trace_loaded();
        }
        debug!(?self, "ScribeConfig loaded (full debug)");
    }
}
