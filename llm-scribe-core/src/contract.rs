//! # contract: the seams between the pipeline and the outside world
//!
//! This module defines the traits the core depends on and the plain data
//! passed across them:
//! - [`FileStore`]: the host's file storage (list/exists/read/write/delete/stat).
//! - [`CompletionService`]: a single raw call to a text-generation endpoint.
//! - [`TemplateRenderer`]: optional structural templating of generated output.
//! - [`Clock`]: wall-clock readings for output names and log entries.
//!
//! ## Mocking & Testing
//! - The async traits are annotated for `mockall` so consumers can generate
//!   deterministic mocks. Mocks are exported with the `test-export-mocks`
//!   feature (on by default) so integration tests can reach them.
//!
//! ## Error Handling
//! - Store failures are reported as [`StoreError`].
//! - Completion failures are reported as [`CompletionError`]; only
//!   [`CompletionError::RateLimited`] is retryable.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Local};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use thiserror::Error;

/// Metadata returned by [`FileStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub modified: SystemTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Abstract file storage. All paths are file identities relative to the
/// store's root.
///
/// Implemented by [`crate::store::LocalFileStore`], [`crate::store::MemoryFileStore`]
/// and by test mocks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// List every file under `prefix`, recursively.
    async fn list(&self, prefix: &Path) -> Result<Vec<PathBuf>, StoreError>;

    async fn exists(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> Result<String, StoreError>;

    /// Create the file or replace its content.
    async fn write(&self, path: &Path, content: &str) -> Result<(), StoreError>;

    async fn delete(&self, path: &Path) -> Result<(), StoreError>;

    async fn stat(&self, path: &Path) -> Result<FileMeta, StoreError>;
}

/// One request to the text-generation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// The source file's content.
    pub content: String,
    /// The user prompt, with `[[links]]` already resolved.
    pub prompt: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("rate limited by completion service")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("completion service returned an empty response")]
    EmptyResponse,
    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),
    #[error("still rate limited after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("request queue closed before the request completed")]
    QueueClosed,
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompletionError::RateLimited)
    }
}

/// A single outbound call to a text-generation endpoint. Retrying, pacing and
/// link resolution happen above this trait.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Combines a structural template with generated content.
///
/// A host-specific templating engine can be plugged in here; the pipeline
/// falls back to [`ConcatTemplateRenderer`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait TemplateRenderer: Send + Sync {
    fn combine(&self, template: &str, generated: &str) -> String;
}

/// Template content, a newline, then the generated content.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatTemplateRenderer;

impl TemplateRenderer for ConcatTemplateRenderer {
    fn combine(&self, template: &str, generated: &str) -> String {
        format!("{template}\n{generated}")
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Always returns the same instant. Used for deterministic names in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}
