#![doc = "Completion client: bridges the core CompletionService trait to an OpenAI-compatible chat completions endpoint."]
//
//! # Completion Client (CLI <-> Core)
//!
//! Wires up [`CompletionService`] from `llm-scribe-core` against a remote
//! chat completions API. The core never sees HTTP; it only sees
//! [`CompletionError`] variants:
//!
//! - HTTP 429 maps to [`CompletionError::RateLimited`] (retried by the core).
//! - Any other non-success status or transport failure maps to
//!   [`CompletionError::Transport`].
//! - A response without usable text maps to [`CompletionError::EmptyResponse`].
//!
//! Construct with [`OpenAiCompletionClient::new`] from the loaded
//! [`ProviderConfig`]; the API key comes from the environment.

use async_trait::async_trait;
use llm_scribe_core::contract::{CompletionError, CompletionRequest, CompletionService};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::load_config::{ProviderConfig, API_KEY_ENV};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

fn build_request<'a>(model: &'a str, request: &'a CompletionRequest) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: &request.prompt,
            },
            ChatMessage {
                role: "user",
                content: &request.content,
            },
        ],
    }
}

fn extract_text(response: ChatResponse) -> Result<String, CompletionError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(CompletionError::EmptyResponse)
}

pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiCompletionClient {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => {
                tracing::error!("{API_KEY_ENV} missing in environment");
                anyhow::bail!("{API_KEY_ENV} environment variable not set");
            }
        };
        tracing::info!(
            base_url = %config.base_url,
            model = %config.model,
            "Initialized completion client"
        );
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", config.base_url),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        tracing::info!(
            model = %self.model,
            content_len = request.content.len(),
            "Requesting completion"
        );
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&build_request(&self.model, request))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, endpoint = %self.endpoint, "Completion request failed to send");
                CompletionError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(endpoint = %self.endpoint, "Completion service rate limited the request");
            return Err(CompletionError::RateLimited);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
            tracing::error!(status = %status, body = %body, "Completion service returned an error");
            return Err(CompletionError::Transport(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "Failed to decode completion response");
            CompletionError::Transport(format!("invalid response body: {e}"))
        })?;
        let text = extract_text(parsed)?;
        tracing::info!(response_len = text.len(), "Completion received");
        Ok(text)
    }
}
