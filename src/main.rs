//! Gemini + MCP chat server
//!
//! Entry point: loads configuration, assembles the agent and serves the chat UI.

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::map_err_ignore)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unused_async)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gemini_mcp_chat::agent::build_agent;
use gemini_mcp_chat::config::{AppConfig, load_llm_settings};
use gemini_mcp_chat::server::start_server;

#[tokio::main]
async fn main() {
    // Load .env (if present) before anything reads the environment
    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.logging.json);

    // Load LLM settings
    let settings = match load_llm_settings(&config.model) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        temperature = settings.temperature,
        protocol = ?settings.protocol,
        "LLM configuration loaded"
    );

    let agent = match build_agent(&config, settings).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Failed to initialize agent");
            std::process::exit(1);
        }
    };

    if let Err(e) = start_server(config, agent).await {
        tracing::error!(error = %format!("{e:#}"), "Server error");
        std::process::exit(1);
    }
}

/// Initialize tracing (M-LOG-STRUCTURED).
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
