//! Reprompt stage — classifies a developer message as *conversation* or
//! *mission* and refines mission text into a precise engineering prompt.
//!
//! The default bias is toward *mission*: on any failure (no key, network,
//! malformed JSON, unknown intent) the stage falls back to
//! `{intent: mission, refined: <original message>}` so the pipeline keeps
//! moving.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{strip_code_fence, ChatClient, ChatMessage, SMALL_MODEL};

const SYSTEM_PROMPT: &str = "\
You are the reprompt engine of Alchemistral, a multi-agent coding orchestration system.

Given a developer's message and project context, do two things:
1. Classify the intent: \"mission\" if the developer wants code changed, built, fixed, \
or deployed; \"conversation\" if they are asking a question or discussing the project.
2. For missions, rewrite the message as a precise, actionable engineering prompt an \
orchestrator can decompose into tasks. Keep the developer's intent exactly; add \
technical specificity (endpoints, components, data models); mention technologies from \
the project's global memory when relevant. For conversations, return the message as-is.

Respond with raw JSON only, no markdown, no code block, exactly:
{\"intent\": \"mission\" | \"conversation\", \"refined\": \"<the refined prompt or original question>\"}";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Mission,
    Conversation,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Mission => write!(f, "mission"),
            Intent::Conversation => write!(f, "conversation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepromptOutcome {
    pub intent: Intent,
    pub refined: String,
}

impl RepromptOutcome {
    fn fallback(message: &str) -> Self {
        Self {
            intent: Intent::Mission,
            refined: message.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RepromptResponse {
    intent: Intent,
    #[serde(default)]
    refined: String,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Parse the model's JSON answer, falling back to a mission pass-through on
/// any irregularity.
pub fn parse_reprompt(raw: &str, original: &str) -> RepromptOutcome {
    let stripped = strip_code_fence(raw);
    match serde_json::from_str::<RepromptResponse>(&stripped) {
        Ok(parsed) => {
            let refined = if parsed.refined.trim().is_empty() {
                original.to_string()
            } else {
                parsed.refined
            };
            RepromptOutcome {
                intent: parsed.intent,
                refined,
            }
        }
        Err(err) => {
            warn!(error = %err, "reprompt response parse failed, defaulting to mission");
            RepromptOutcome::fallback(original)
        }
    }
}

/// Classify and refine a developer message.
pub async fn reprompt(
    client: &dyn ChatClient,
    message: &str,
    global_memory: &str,
    codebase_summary: &str,
) -> RepromptOutcome {
    if !client.has_key() {
        warn!("MISTRAL_API_KEY not set, reprompt defaulting to mission pass-through");
        return RepromptOutcome::fallback(message);
    }

    let mut ctx_parts = Vec::new();
    if !global_memory.trim().is_empty() {
        ctx_parts.push(format!("Global memory:\n{global_memory}"));
    }
    if !codebase_summary.trim().is_empty() {
        ctx_parts.push(format!("Codebase scan:\n{codebase_summary}"));
    }
    ctx_parts.push(format!("Developer message:\n{message}"));
    let user_content = ctx_parts.join("\n\n");

    let messages = [
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_content),
    ];

    match client.chat(SMALL_MODEL, &messages, 0.3).await {
        Ok(text) => parse_reprompt(&text, message),
        Err(err) => {
            warn!(error = %err, "reprompt API call failed, defaulting to mission");
            RepromptOutcome::fallback(message)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        key: bool,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                key: true,
            }
        }

        fn keyless() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                key: false,
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<String, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(LlmError::MissingKey))
        }

        fn has_key(&self) -> bool {
            self.key
        }
    }

    #[tokio::test]
    async fn missing_key_returns_mission_passthrough() {
        let client = ScriptedClient::keyless();
        let outcome = reprompt(&client, "add a hello endpoint", "", "").await;
        assert_eq!(outcome.intent, Intent::Mission);
        assert_eq!(outcome.refined, "add a hello endpoint");
    }

    #[tokio::test]
    async fn api_error_returns_mission_passthrough() {
        let client = ScriptedClient::new(vec![Err(LlmError::Timeout)]);
        let outcome = reprompt(&client, "fix the login bug", "mem", "scan").await;
        assert_eq!(outcome.intent, Intent::Mission);
        assert_eq!(outcome.refined, "fix the login bug");
    }

    #[tokio::test]
    async fn conversation_intent_is_parsed() {
        let client = ScriptedClient::new(vec![Ok(
            r#"{"intent": "conversation", "refined": "How is auth implemented?"}"#.into(),
        )]);
        let outcome = reprompt(&client, "How is auth implemented?", "", "").await;
        assert_eq!(outcome.intent, Intent::Conversation);
        assert_eq!(outcome.refined, "How is auth implemented?");
    }

    #[test]
    fn parse_strips_markdown_fence() {
        let raw = "```json\n{\"intent\": \"mission\", \"refined\": \"Implement /hello\"}\n```";
        let outcome = parse_reprompt(raw, "original");
        assert_eq!(outcome.intent, Intent::Mission);
        assert_eq!(outcome.refined, "Implement /hello");
    }

    #[test]
    fn parse_unknown_intent_falls_back() {
        let raw = r#"{"intent": "question", "refined": "whatever"}"#;
        let outcome = parse_reprompt(raw, "original message");
        assert_eq!(outcome.intent, Intent::Mission);
        assert_eq!(outcome.refined, "original message");
    }

    #[test]
    fn parse_garbage_falls_back() {
        let outcome = parse_reprompt("I think you should...", "original message");
        assert_eq!(outcome, RepromptOutcome::fallback("original message"));
    }

    #[test]
    fn parse_empty_refined_uses_original() {
        let raw = r#"{"intent": "mission", "refined": ""}"#;
        let outcome = parse_reprompt(raw, "original message");
        assert_eq!(outcome.refined, "original message");
    }
}
