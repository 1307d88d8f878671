//! CLI interface for llm-scribe: command parsing and orchestration glue.
//!
//! All pipeline logic (matching, debouncing, queueing, output placement) lives
//! in the [`llm-scribe-core`] crate. This module only wires the loaded
//! configuration to a file store, a completion client and the monitor.
//!
//! ## How To Use
//! - For command-line users: use the installed `llm-scribe` binary with `--help`.
//! - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
//!
//! [`llm-scribe-core`]: ../../llm-scribe-core/

use crate::completion_client::OpenAiCompletionClient;
use crate::load_config::{load_config, AppConfig};
use crate::watch::start_watching;
use anyhow::Result;
use clap::{Parser, Subcommand};
use llm_scribe_core::contract::{CompletionService, FileStore, SystemClock};
use llm_scribe_core::monitor::Monitor;
use llm_scribe_core::pipeline::RunReport;
use llm_scribe_core::store::LocalFileStore;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI for llm-scribe: rewrite notes in watched folders through a language model.
#[derive(Parser)]
#[clap(
    name = "llm-scribe",
    version,
    about = "Watch note folders and write model-generated output for matching files"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch all rule folders and process files as they change (runs until Ctrl-C)
    Watch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Scan every rule folder once, process what is due, then exit
    Scan {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Process a single file immediately against every rule that watches it
    Process {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// File path relative to the vault root
        #[clap(long)]
        file: PathBuf,
    },
    /// Validate the config file and list its rules
    Check {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

fn build_monitor(config: &AppConfig) -> Result<Arc<Monitor>> {
    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(config.vault_root.clone()));
    let service: Arc<dyn CompletionService> = Arc::new(OpenAiCompletionClient::new(&config.provider)?);
    Ok(Arc::new(Monitor::new(
        &config.scribe,
        store,
        service,
        Arc::new(SystemClock),
    )))
}

fn print_reports(reports: &[RunReport]) {
    let done = reports.iter().filter(|r| r.outcome.is_done()).count();
    let skipped = reports.iter().filter(|r| r.outcome.is_skip()).count();
    println!(
        "Processed {} run(s): {} done, {} skipped, {} failed.",
        reports.len(),
        done,
        skipped,
        reports.len() - done - skipped
    );
    for report in reports {
        println!("  [{}] {}: {:?}", report.rule, report.path.display(), report.outcome);
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(config)?;
            println!("Configuration OK: vault root {}", config.vault_root.display());
            println!("Model: {} at {}", config.provider.model, config.provider.base_url);
            for rule in &config.scribe.rules {
                println!(
                    "  rule '{}' ({}): {} in {:?}, every {}s, {:?}",
                    rule.name,
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.file_name_template,
                    rule.folders,
                    rule.delay,
                    rule.output_file_handling,
                );
            }
            Ok(())
        }
        Commands::Scan { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "scan", "Starting one-off scan");
            let monitor = build_monitor(&config)?;
            let reports = monitor.scan_once().await;
            print_reports(&reports);
            Ok(())
        }
        Commands::Process { config, file } => {
            let config = load_config(config)?;
            tracing::info!(command = "process", file = %file.display(), "Processing single file");
            let monitor = build_monitor(&config)?;
            let reports = monitor.process_now(&file).await;
            if reports.is_empty() {
                println!("No enabled rule watches {}.", file.display());
            }
            print_reports(&reports);
            Ok(())
        }
        Commands::Watch { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "watch", "Starting watcher");
            let monitor = build_monitor(&config)?;
            let handle = start_watching(&config.vault_root, Arc::clone(&monitor))?;
            monitor.start_polling();
            println!("Watching {} (Ctrl-C to stop)...", config.vault_root.display());
            tokio::signal::ctrl_c().await?;
            tracing::info!(command = "watch", "Shutdown requested");
            handle.stop();
            monitor.shutdown();
            Ok(())
        }
    }
}
