//! Gemini + MCP chat
//!
//! A web chat application that wires Gemini to external tool servers through
//! the Model Context Protocol and serves the resulting agent as a chat widget.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server with a JSON chat API
//! - **Agent**: startup assembly (failure-tolerant) and the per-message turn handler
//! - **LLM Orchestration**: tool loop over Chat Completions or native Gemini drivers
//! - **MCP Client**: tool discovery and execution via Model Context Protocol
//!
//! # Modules
//!
//! - [`agent`]: agent assembly, turn handling, image extraction
//! - [`llm`]: LLM driver traits and implementations
//! - [`mcp`]: MCP client configuration and registry
//! - [`normalized`]: Unified streaming event model
//! - [`session`]: Conversation and session management

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod normalized;
pub mod server;
pub mod session;

use crate::agent::Agent;
use crate::config::AppConfig;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The assembled agent (tools, model, sessions).
    pub agent: Agent,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
