//! Async Mistral chat-completions client.
//!
//! The API key is read from the environment on every request, not at
//! construction, so a rotated key takes effect without a restart.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Model used for the reprompt stage.
pub const SMALL_MODEL: &str = "mistral-small-latest";

/// Model used for the orchestrator and conversation stages.
pub const LARGE_MODEL: &str = "mistral-large-latest";

const BASE_URL: &str = "https://api.mistral.ai/v1";

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key configured in the environment.
    #[error("MISTRAL_API_KEY is not set")]
    MissingKey,

    /// Connection-level failure (DNS, TLS, refused, ...).
    #[error("http error: {0}")]
    Http(String),

    /// Non-2xx response from the API.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response body did not match the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// The request exceeded the 60-second budget.
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatClient trait
// ---------------------------------------------------------------------------

/// Capability for one-shot chat completions. The real implementation talks
/// to Mistral; tests inject scripted clients.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Single completion: returns the assistant message text.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Whether a key is currently available. Stages use this to short-circuit
    /// into their fallbacks without issuing a request.
    fn has_key(&self) -> bool;
}

// ---------------------------------------------------------------------------
// MistralClient
// ---------------------------------------------------------------------------

pub struct MistralClient {
    http: reqwest::Client,
    base_url: String,
}

impl MistralClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Override the base URL (useful for testing against a local server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for MistralClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl ChatClient for MistralClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError> {
        // Key is read per-request; rotations apply immediately.
        let api_key = alch_core::config::mistral_api_key().ok_or(LlmError::MissingKey)?;

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&ChatRequest {
                model,
                messages,
                temperature,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("response contained no choices".into()))
    }

    fn has_key(&self) -> bool {
        alch_core::config::mistral_api_key().is_some()
    }
}

// ---------------------------------------------------------------------------
// Fence stripping
// ---------------------------------------------------------------------------

/// Strip a leading/trailing triple-backtick fence (with optional language
/// tag) from an LLM response before JSON decoding.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let lines: Vec<&str> = trimmed.lines().collect();
    let mut end = lines.len();
    for i in (1..lines.len()).rev() {
        if lines[i].trim() == "```" {
            end = i;
            break;
        }
    }
    lines[1..end].join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
