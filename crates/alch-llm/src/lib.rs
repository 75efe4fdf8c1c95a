//! LLM stages for alchemistral — a thin Mistral chat client plus the two
//! planning stages built on it (reprompt and orchestrator).
//!
//! Both stages absorb every failure into deterministic fallbacks so a missing
//! key, a network error, or a malformed response never aborts a mission.

pub mod client;
pub mod orchestrator;
pub mod reprompt;

pub use client::{ChatClient, ChatMessage, LlmError, MistralClient, LARGE_MODEL, SMALL_MODEL};
