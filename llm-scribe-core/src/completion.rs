//! Completion service adapter.
//!
//! Wraps a raw [`CompletionService`] call with:
//! - resolution of `[[path]]` links in the prompt against the file store,
//! - up to [`MAX_ATTEMPTS`] attempts when the service reports a rate limit,
//! - a timeout on every attempt.
//!
//! Failures are returned as [`CompletionError`]; what to do with them is the
//! pipeline's decision.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use crate::contract::{CompletionError, CompletionRequest, CompletionService, FileStore};
use crate::template::NOTE_EXTENSION;

pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\[([^\[\]]+?)\]\]").expect("link pattern is valid"))
}

/// A prompt after link substitution, plus the links that could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrompt {
    pub text: String,
    pub unresolved: Vec<String>,
}

/// Candidate store paths for a link target: the target itself, then with the
/// note extension when it has none.
fn link_candidates(target: &str) -> Vec<PathBuf> {
    let path = PathBuf::from(target);
    let mut candidates = vec![path.clone()];
    if path.extension().is_none() {
        candidates.push(path.with_extension(NOTE_EXTENSION));
    }
    candidates
}

/// Replace every `[[target]]` or `[[target|alias]]` in `prompt` with the
/// content of the referenced file. Unknown links are left verbatim.
pub async fn resolve_links(prompt: &str, store: &dyn FileStore) -> ResolvedPrompt {
    let pattern = link_pattern();
    let mut contents: Vec<Option<String>> = Vec::new();
    let mut unresolved = Vec::new();

    for caps in pattern.captures_iter(prompt) {
        let raw = &caps[1];
        let target = raw.split('|').next().unwrap_or(raw).trim();
        let mut found = None;
        for candidate in link_candidates(target) {
            if !store.exists(&candidate).await {
                continue;
            }
            match store.read(&candidate).await {
                Ok(content) => {
                    debug!(link = %target, path = %candidate.display(), "Resolved prompt link");
                    found = Some(content);
                    break;
                }
                Err(e) => {
                    warn!(link = %target, error = %e, "Failed to read linked file");
                }
            }
        }
        if found.is_none() {
            warn!(link = %target, "Unresolved link in prompt; leaving it verbatim");
            unresolved.push(target.to_string());
        }
        contents.push(found);
    }

    let mut index = 0;
    let text = pattern
        .replace_all(prompt, |caps: &Captures<'_>| {
            let replacement = contents
                .get(index)
                .cloned()
                .flatten()
                .unwrap_or_else(|| caps[0].to_string());
            index += 1;
            replacement
        })
        .into_owned();

    ResolvedPrompt { text, unresolved }
}

/// Resolves links, then calls the service with bounded retries.
pub struct CompletionAdapter {
    service: Arc<dyn CompletionService>,
    store: Arc<dyn FileStore>,
    attempt_timeout: Duration,
    backoff: Duration,
    max_attempts: u32,
}

impl CompletionAdapter {
    pub fn new(
        service: Arc<dyn CompletionService>,
        store: Arc<dyn FileStore>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            service,
            store,
            attempt_timeout,
            backoff: RETRY_BACKOFF,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub async fn complete(&self, content: &str, prompt: &str) -> Result<String, CompletionError> {
        let resolved = resolve_links(prompt, self.store.as_ref()).await;
        let request = CompletionRequest {
            content: content.to_string(),
            prompt: resolved.text,
        };

        let mut attempt = 1;
        loop {
            debug!(attempt, "Calling completion service");
            let result = match tokio::time::timeout(
                self.attempt_timeout,
                self.service.complete(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CompletionError::Timeout(self.attempt_timeout)),
            };

            match result {
                Ok(text) if text.trim().is_empty() => return Err(CompletionError::EmptyResponse),
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, "Completion still rate limited; giving up");
                        return Err(CompletionError::RetriesExhausted { attempts: attempt });
                    }
                    info!(attempt, backoff = ?self.backoff, "Rate limited; retrying after backoff");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Completion failed without retry");
                    return Err(e);
                }
            }
        }
    }
}
