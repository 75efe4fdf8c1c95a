//! Coding-agent plumbing for alchemistral: the CLI adapter capability over
//! coding-agent subprocesses, the domain prompt builder, and the agent
//! manager that owns per-agent lifecycle and event relay.

pub mod cli_adapter;
pub mod manager;
pub mod prompts;

pub use cli_adapter::{get_adapter, AdapterError, AdapterEvent, AgentConfig, CliAdapter};
pub use manager::{AgentManager, SpawnAgentRequest};
