#![doc = "llm-scribe-core: core logic library for llm-scribe."]

//! This crate contains the folder-watching pipeline: rule matching, debounced
//! change handling, the rate-limited completion queue, output placement and
//! the activity log. Network clients and the CLI live in the `llm-scribe` crate.
//!
//! # Usage
//! Build a [`monitor::Monitor`] from a [`config::ScribeConfig`], a
//! [`contract::FileStore`] and a [`contract::CompletionService`], then feed it
//! change events or start its pollers.

pub mod activity_log;
pub mod completion;
pub mod config;
pub mod contract;
pub mod debounce;
pub mod matcher;
pub mod monitor;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod store;
pub mod template;
