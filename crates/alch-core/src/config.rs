//! Process-wide configuration read from the environment.
//!
//! The Mistral key is deliberately re-read on every call rather than cached:
//! a key rotated while the daemon is running takes effect on the next request
//! without a rebuild or restart.

/// Env var holding the Mistral API key.
pub const API_KEY_ENV: &str = "MISTRAL_API_KEY";

/// Env var forcing the mock CLI adapter for every spawned agent.
pub const DEMO_MODE_ENV: &str = "DEMO_MODE";

/// Env var overriding the daemon listen port.
pub const PORT_ENV: &str = "ALCH_PORT";

/// Current Mistral API key, if set and non-empty.
pub fn mistral_api_key() -> Option<String> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => None,
    }
}

/// Whether demo mode is active (`DEMO_MODE=true`, case-insensitive).
pub fn demo_mode() -> bool {
    std::env::var(DEMO_MODE_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Daemon listen port (`ALCH_PORT`, default 8000).
pub fn daemon_port() -> u16 {
    std::env::var(PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}
