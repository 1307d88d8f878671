use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use llm_scribe_core::config::{
    CompletionFailurePolicy, MonitoringRule, ScribeConfig, DEFAULT_LOG_FILE,
    DEFAULT_REQUEST_INTERVAL, DEFAULT_REQUEST_TIMEOUT,
};
use serde::Deserialize;
use tracing::{error, info};

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Deserialize)]
struct StaticConfig {
    vault_root: PathBuf,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    on_completion_failure: CompletionFailurePolicy,
    provider: ProviderSection,
    #[serde(default)]
    rules: Vec<MonitoringRule>,
}

#[derive(Deserialize)]
struct ProviderSection {
    model: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    request_interval_secs: Option<u64>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
}

/// Where and how to reach the completion provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub model: String,
    pub base_url: String,
    /// Injected from the environment, never read from the file.
    pub api_key: Option<String>,
}

/// Fully merged configuration: the static file plus secrets from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub vault_root: PathBuf,
    pub provider: ProviderConfig,
    pub scribe: ScribeConfig,
}

/// Loads a static YAML config file (no secrets) and injects the API key from
/// the environment when it is set. Relative `vault_root` paths are resolved
/// against the config file's directory.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let static_conf: StaticConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let api_key = match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => {
            info!("{API_KEY_ENV} found in env");
            Some(key)
        }
        _ => {
            info!("{API_KEY_ENV} not set; provider calls will be unavailable");
            None
        }
    };

    let vault_root = if static_conf.vault_root.is_absolute() {
        static_conf.vault_root
    } else {
        path_ref
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(static_conf.vault_root)
    };

    let provider = ProviderConfig {
        model: static_conf.provider.model,
        base_url: static_conf
            .provider
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        api_key,
    };

    let mut scribe = ScribeConfig {
        rules: static_conf.rules,
        log_file: static_conf
            .log_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        request_interval: static_conf
            .provider
            .request_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_INTERVAL),
        request_timeout: static_conf
            .provider
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        on_completion_failure: static_conf.on_completion_failure,
    };

    if let Err(e) = scribe.validate() {
        error!(error = %e, "Invalid rule configuration");
        anyhow::bail!("Invalid rule configuration: {e}");
    }
    scribe.trace_loaded();

    info!(
        vault_root = %vault_root.display(),
        model = %provider.model,
        rules = scribe.rules.len(),
        "Config loaded and merged successfully"
    );

    Ok(AppConfig {
        vault_root,
        provider,
        scribe,
    })
}
