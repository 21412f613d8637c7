//! Talking to Gemini.
//!
//! A [`LlmDriver`] sends one request and streams the reply back as
//! [`NormalizedEvent`]s, whichever wire protocol it speaks. The
//! [`Orchestrator`] runs the tool loop on top of a driver.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: OpenAI-compatible Chat Completions (`/v1beta/openai/chat/completions` on Gemini)
//! - [`GeminiDriver`]: native Gemini API (`models/{model}:streamGenerateContent`)
//!
//! # Example
//!
//! ```rust,ignore
//! use gemini_mcp_chat::llm::{LlmSettings, LlmProtocol, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://generativelanguage.googleapis.com".to_string(),
//!     api_key: Some("...".to_string()),
//!     model: "gemini-2.5-flash".to_string(),
//!     temperature: 0.7,
//!     protocol: LlmProtocol::Chat,
//!     provider: Provider::Gemini,
//! };
//! ```

pub mod chat_completions;
pub mod gemini;
pub mod orchestrator;
pub mod provider;

pub use chat_completions::ChatCompletionsDriver;
pub use gemini::GeminiDriver;
pub use orchestrator::{Orchestrator, ToolInvocation, TurnOutcome};
pub use provider::Provider;

use crate::normalized::NormalizedEvent;
use futures::Stream;

/// Where and how to reach the model. `Debug` redacts the key.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://generativelanguage.googleapis.com`).
    pub base_url: String,
    /// `GOOGLE_API_KEY`, else `GEMINI_API_KEY`.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gemini-2.5-flash`).
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    pub protocol: LlmProtocol,
    /// Provider type (auto-detected from `base_url`).
    pub provider: Provider,
}

// The API key stays out of logs.
impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("protocol", &self.protocol)
            .field("provider", &self.provider)
            .finish()
    }
}

/// LLM protocol variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LlmProtocol {
    /// Pick the protocol from the provider (Chat Completions).
    #[default]
    Auto,
    /// OpenAI-compatible Chat Completions.
    Chat,
    /// Native Gemini `streamGenerateContent`.
    Native,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content of the message.
    pub content: String,
    /// Optional tool call ID (for tool responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A function call recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Request to an LLM driver.
///
/// Messages and tools use the Chat Completions wire shape; drivers for other
/// protocols translate from it.
#[derive(Debug)]
pub struct LlmRequest {
    /// Conversation messages.
    pub messages: Vec<serde_json::Value>,
    /// Available tools in `OpenAI` function schema format.
    pub tools: Vec<serde_json::Value>,
}

/// Boxed stream of driver events.
pub type EventStream =
    std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<NormalizedEvent>> + Send>>;

/// One wire protocol to the model.
///
/// A response that requests tools must emit one `ToolCallComplete` per call;
/// the orchestrator ignores partial deltas.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Stream a response from the LLM.
    ///
    /// # Errors
    ///
    /// Fails on transport errors and non-2xx statuses. Errors inside an
    /// already open stream arrive as `Err` items.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream>;
}

/// Turn a non-success HTTP response into an error carrying the body excerpt.
pub(crate) async fn error_for_status_with_body(
    resp: reqwest::Response,
) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(500).collect();
    anyhow::bail!("LLM request failed with HTTP {status}: {excerpt}")
}

/// Find the end of the next SSE frame (`\n\n` or `\r\n\r\n`) as
/// `(frame_end, separator_len)`.
pub(crate) fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Collect the `data:` payload of one SSE frame (multiple lines joined by `\n`).
pub(crate) fn frame_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim)
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
