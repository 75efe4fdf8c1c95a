//! alchemistral daemon — wires the project registry, agent manager, mission
//! pipeline, and event bus behind the HTTP/WS transport.

mod http;
mod logging;

use std::net::SocketAddr;

use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging("alch-daemon", "info");

    // Surface key misconfiguration at startup; the key itself is re-read
    // from the environment on every LLM request.
    match alch_core::config::mistral_api_key() {
        Some(key) => {
            let prefix: String = key.chars().take(8).collect();
            info!("MISTRAL_API_KEY loaded: {prefix}...");
        }
        None => {
            warn!("MISTRAL_API_KEY is not set, planning stages will use mock fallbacks");
        }
    }
    if alch_core::config::demo_mode() {
        info!("DEMO_MODE is on, agents will use the mock adapter");
    }

    let state = http::AppState::new();
    let app = http::router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], alch_core::config::daemon_port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "alchemistral daemon listening");
    axum::serve(listener, app).await?;
    Ok(())
}
