//! Provider-neutral events produced while a model answers.
//!
//! Both Gemini drivers (Chat Completions and native) turn their wire chunks
//! into [`NormalizedEvent`]s, and the orchestrator's tool loop consumes
//! nothing else. The orchestrator re-emits the same model with tool results
//! spliced in, so one turn reads as a single ordered event log.
//!
//! ```rust
//! use gemini_mcp_chat::normalized::{NormalizedEvent, event_name};
//!
//! let event = NormalizedEvent::MessageDelta {
//!     text: "Found 3 papers".to_string(),
//! };
//! assert_eq!(event_name(&event), "message.delta");
//! ```

use serde::{Deserialize, Serialize};

/// One step of a model turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NormalizedEvent {
    /// First event of an orchestrated turn.
    #[serde(rename = "stream.start")]
    StreamStart {
        /// Correlates every log line of this turn.
        request_id: String,
    },

    /// A piece of visible answer text.
    #[serde(rename = "message.delta")]
    MessageDelta { text: String },

    /// A piece of the model's thought summary. Never shown to the user.
    #[serde(rename = "thinking.delta")]
    ThinkingDelta { text: String },

    /// Partial function call as it arrives on the wire.
    ///
    /// Fields are filled in over several chunks; consumers that only care
    /// about finished calls can wait for [`NormalizedEvent::ToolCallComplete`].
    #[serde(rename = "tool_call.delta")]
    ToolCallDelta {
        /// Position of the call within the model response.
        call_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Raw slice of the arguments JSON.
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_delta: Option<String>,
    },

    /// A function call the model wants executed.
    #[serde(rename = "tool_call.complete")]
    ToolCallComplete {
        call_index: usize,
        id: String,
        /// Exposed tool name, as listed in the request's tool table.
        name: String,
        /// Arguments as a JSON document; `"{}"` when the model sent none.
        arguments_json: String,
    },

    /// Outcome of running a tool, exactly as it was handed back to the model.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// The `ToolCallComplete` id this answers.
        id: String,
        name: String,
        /// Tool output, or `Error: ...` when the call failed.
        content: String,
        #[serde(default = "default_true")]
        success: bool,
    },

    /// The turn cannot continue.
    #[serde(rename = "error")]
    Error {
        message: String,
        /// Stable code such as `LLM_ERROR` or `MAX_ITERATIONS`.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// End of the response (driver) or of the whole turn (orchestrator).
    #[serde(rename = "done")]
    Done,
}

fn default_true() -> bool {
    true
}

/// Serde tag of `evt`, handy as a structured log field.
#[must_use]
pub fn event_name(evt: &NormalizedEvent) -> &'static str {
    match evt {
        NormalizedEvent::StreamStart { .. } => "stream.start",
        NormalizedEvent::MessageDelta { .. } => "message.delta",
        NormalizedEvent::ThinkingDelta { .. } => "thinking.delta",
        NormalizedEvent::ToolCallDelta { .. } => "tool_call.delta",
        NormalizedEvent::ToolCallComplete { .. } => "tool_call.complete",
        NormalizedEvent::ToolResult { .. } => "tool_result",
        NormalizedEvent::Error { .. } => "error",
        NormalizedEvent::Done => "done",
    }
}
