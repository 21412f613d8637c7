//! The chat agent: assembly at startup and the per-message turn handler.
//!
//! [`build_agent`] connects every configured MCP server, tolerating the ones
//! that fail, and wires the surviving tools into an [`Orchestrator`].
//! [`Agent::handle_turn`] runs one user message through the tool loop and
//! prepares the answer for display.

pub mod images;
pub mod markdown;
pub mod prompt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::AppConfig;
use crate::error::TurnError;
use crate::llm::orchestrator::preview;
use crate::llm::{LlmSettings, Message, Orchestrator, ToolInvocation};
use crate::mcp::config::load_mcp_config_or_empty;
use crate::mcp::registry::McpRegistry;
use crate::session::{Session, SessionStore};

pub use images::{ExtractedImages, extract_images};
pub use markdown::render_markdown;

/// What the chat widget shows for one answered message.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    /// Answer text with bare image URLs turned into markdown images.
    pub display_text: String,
    pub display_html: String,
    pub images: Vec<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

/// A ready-to-use agent session: model, tools, system prompt and histories.
#[derive(Clone)]
pub struct Agent {
    orchestrator: Orchestrator,
    system_prompt: Arc<str>,
    sessions: SessionStore,
    turn_timeout: Duration,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("orchestrator", &self.orchestrator)
            .field("sessions", &self.sessions.len())
            .field("turn_timeout", &self.turn_timeout)
            .finish_non_exhaustive()
    }
}

/// Assemble the agent from configuration.
///
/// Unreachable MCP servers are logged and left out; only a malformed
/// `mcp.json` or an unreadable system prompt file aborts startup.
pub async fn build_agent(config: &AppConfig, settings: LlmSettings) -> anyhow::Result<Agent> {
    let system_prompt = config.agent.resolve_system_prompt()?;

    let mcp_config = load_mcp_config_or_empty(&config.mcp.config_path)?;
    if mcp_config.mcp_servers.is_empty() {
        tracing::warn!(
            path = %config.mcp.config_path.display(),
            "No MCP servers configured, the agent will run without tools"
        );
    }

    let registry = McpRegistry::connect_all(&mcp_config, config.mcp.connect_timeout()).await;
    log_tool_banner(&registry);

    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(registry),
        config.agent.max_tool_iterations,
    );

    Ok(Agent::new(
        orchestrator,
        system_prompt,
        config.agent.turn_timeout(),
    ))
}

fn log_tool_banner(registry: &McpRegistry) {
    let report = registry.report();
    tracing::info!(
        name: "agent.tools.loaded",
        tool_count = registry.len(),
        connected_servers = report.connected.len(),
        failed_servers = report.failed.len(),
        "Loaded tools from MCP servers"
    );

    for (name, tool) in registry.tools() {
        let description = tool
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or("No description");
        tracing::info!(
            name: "mcp.tool.discovered",
            tool = %name,
            server = registry.server_of(name).unwrap_or_default(),
            description = %preview(description, 50),
            "Tool available"
        );
    }
}

impl Agent {
    #[must_use]
    pub fn new(
        orchestrator: Orchestrator,
        system_prompt: impl Into<String>,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            system_prompt: Arc::from(system_prompt.into()),
            sessions: SessionStore::new(),
            turn_timeout,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &McpRegistry {
        self.orchestrator.mcp()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Start a fresh conversation ("New Chat").
    #[must_use]
    pub fn new_session(&self) -> Session {
        let session = self.sessions.create();
        tracing::info!(session_id = %session.id(), "New chat session");
        session
    }

    /// Answer one user message in `session`.
    ///
    /// The model sees the system prompt, the session history and the new
    /// message. History grows by exactly one user and one assistant entry,
    /// and only when an answer was produced.
    ///
    /// # Errors
    ///
    /// See [`TurnError`]; every variant leaves the history unchanged.
    pub async fn handle_turn(
        &self,
        session: &Session,
        user_message: &str,
    ) -> Result<TurnReply, TurnError> {
        if user_message.trim().is_empty() {
            return Err(TurnError::EmptyMessage);
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.turn_timeout;

        let _turn = tokio::time::timeout_at(deadline, session.lock_turn())
            .await
            .map_err(|_| {
                tracing::warn!(session_id = %session.id(), "Gave up waiting for the running turn");
                TurnError::SessionBusy
            })?;

        let history = session.messages();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(&*self.system_prompt));
        messages.extend(history);
        messages.push(Message::user(user_message));

        tracing::info!(
            name: "agent.turn.started",
            session_id = %session.id(),
            history_len = messages.len() - 2,
            query = %preview(user_message, 100),
            "User query"
        );

        let outcome = match tokio::time::timeout_at(deadline, self.orchestrator.run(messages)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(
                    session_id = %session.id(),
                    error = %e,
                    "Turn failed"
                );
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    session_id = %session.id(),
                    timeout_secs = self.turn_timeout.as_secs(),
                    "Turn timed out"
                );
                return Err(TurnError::Timeout(self.turn_timeout));
            }
        };

        let ExtractedImages { text, images } = extract_images(&outcome.answer);
        for url in &images {
            tracing::info!(session_id = %session.id(), url = %url, "Image found in response");
        }

        session.commit_turn(user_message, text.clone());

        tracing::info!(
            name: "agent.turn.completed",
            session_id = %session.id(),
            answer_chars = outcome.answer.chars().count(),
            tool_calls = outcome.tool_calls.len(),
            images = images.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Response ready"
        );

        Ok(TurnReply {
            session_id: session.id().to_string(),
            display_html: render_markdown(&text),
            display_text: text,
            images,
            tool_calls: outcome.tool_calls,
        })
    }
}
