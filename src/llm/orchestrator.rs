//! The tool loop.
//!
//! Each iteration sends the working transcript to the model. When the reply
//! asks for tools, every call runs through the [`McpRegistry`] and its result
//! (or `Error: ...`) is appended as a `tool` message before the next
//! iteration. A reply without tool calls ends the turn.
//!
//! # Example
//!
//! ```rust,ignore
//! use gemini_mcp_chat::llm::{Message, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(settings, registry, 10);
//! let outcome = orchestrator
//!     .run(vec![Message::system(prompt), Message::user("Find papers on RLHF")])
//!     .await?;
//! println!("{}", outcome.answer);
//! ```

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::error::TurnError;
use crate::mcp::registry::McpRegistry;
use crate::normalized::{NormalizedEvent, event_name};

use super::{
    ChatCompletionsDriver, GeminiDriver, LlmDriver, LlmProtocol, LlmRequest, LlmSettings, Message,
    ToolCall, ToolCallFunction,
};

const ARGS_PREVIEW_CHARS: usize = 100;
const RESULT_PREVIEW_CHARS: usize = 150;
const THOUGHT_PREVIEW_CHARS: usize = 200;

const LLM_ERROR_CODE: &str = "LLM_ERROR";
const MAX_ITERATIONS_CODE: &str = "MAX_ITERATIONS";

/// One tool call made during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    /// First characters of the content fed back to the model.
    pub result_preview: String,
}

/// Final result of a drained tool loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnOutcome {
    /// Text of the model's last response (the one that requested no tools).
    pub answer: String,
    pub tool_calls: Vec<ToolInvocation>,
}

/// Drives one model through as many tool rounds as a turn needs, capped at
/// `max_iterations` model requests.
#[derive(Clone)]
pub struct Orchestrator {
    model: String,
    mcp: Arc<McpRegistry>,
    driver: Arc<dyn LlmDriver>,
    max_iterations: usize,
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("model", &self.model)
            .field("mcp", &self.mcp)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl Orchestrator {
    /// Create a new orchestrator with the given settings and MCP registry.
    pub fn new(settings: LlmSettings, mcp: Arc<McpRegistry>, max_iterations: usize) -> Self {
        let driver: Arc<dyn LlmDriver> = match settings.protocol {
            LlmProtocol::Native => Arc::new(GeminiDriver::new(settings.clone())),
            // Chat Completions also carries Gemini's function calling unchanged.
            LlmProtocol::Chat | LlmProtocol::Auto => {
                Arc::new(ChatCompletionsDriver::new(settings.clone()))
            }
        };

        Self {
            model: settings.model,
            mcp,
            driver,
            max_iterations,
        }
    }

    /// Create an orchestrator around an already-built driver.
    pub fn with_driver(
        driver: Arc<dyn LlmDriver>,
        mcp: Arc<McpRegistry>,
        max_iterations: usize,
    ) -> Self {
        Self {
            model: "custom".to_string(),
            mcp,
            driver,
            max_iterations,
        }
    }

    /// Get the MCP registry.
    #[must_use]
    pub fn mcp(&self) -> &McpRegistry {
        &self.mcp
    }

    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Start a chat interaction with existing message history.
    ///
    /// Returns a stream of [`NormalizedEvent`]s that includes:
    /// - `StreamStart` with a unique request ID
    /// - `MessageDelta` / `ThinkingDelta` for model output
    /// - `ToolCallDelta` and `ToolCallComplete` for tool calls
    /// - `ToolResult` after tool execution
    /// - `Error` or `Done` as the last event
    #[allow(clippy::too_many_lines)]
    pub fn chat_with_history(
        &self,
        messages: Vec<Message>,
    ) -> impl Stream<Item = NormalizedEvent> + Send + 'static {
        let request_id = Uuid::new_v4().to_string();
        let tools = self.mcp.openai_tools_json();

        tracing::info!(
            request_id = %request_id,
            message_count = messages.len(),
            tool_count = tools.len(),
            "Starting orchestrator chat"
        );

        let orchestrator = self.clone();

        async_stream::stream! {
            yield NormalizedEvent::StreamStart {
                request_id: request_id.clone(),
            };

            let mut message_json: Vec<serde_json::Value> = Vec::with_capacity(messages.len());
            for m in &messages {
                match serde_json::to_value(m) {
                    Ok(v) => message_json.push(v),
                    Err(e) => {
                        yield NormalizedEvent::Error {
                            message: format!("failed to encode message history: {e}"),
                            code: Some(LLM_ERROR_CODE.to_string()),
                        };
                        return;
                    }
                }
            }

            let mut iteration = 0;

            loop {
                if iteration >= orchestrator.max_iterations {
                    tracing::error!(
                        request_id = %request_id,
                        iteration = iteration,
                        max_iterations = orchestrator.max_iterations,
                        "Maximum tool loop iterations exceeded"
                    );
                    yield NormalizedEvent::Error {
                        message: "Maximum tool loop iterations exceeded".to_string(),
                        code: Some(MAX_ITERATIONS_CODE.to_string()),
                    };
                    break;
                }
                iteration += 1;

                tracing::info!(
                    request_id = %request_id,
                    iteration = iteration,
                    message_count = message_json.len(),
                    "Starting tool loop iteration"
                );

                let req = LlmRequest {
                    messages: message_json.clone(),
                    tools: tools.clone(),
                };

                let driver_stream = match orchestrator.driver.stream(req).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(
                            request_id = %request_id,
                            iteration = iteration,
                            error = %e,
                            "Failed to create driver stream"
                        );
                        yield NormalizedEvent::Error {
                            message: e.to_string(),
                            code: Some(LLM_ERROR_CODE.to_string()),
                        };
                        return;
                    }
                };

                let mut tool_calls: Vec<ToolCall> = Vec::new();
                let mut assistant_text = String::new();

                futures::pin_mut!(driver_stream);

                while let Some(result) = driver_stream.next().await {
                    match result {
                        Ok(event) => {
                            tracing::trace!(
                                request_id = %request_id,
                                event = event_name(&event),
                                "Driver event"
                            );
                            match &event {
                                NormalizedEvent::MessageDelta { text } => {
                                    assistant_text.push_str(text);
                                }
                                NormalizedEvent::ToolCallComplete {
                                    id,
                                    name,
                                    arguments_json,
                                    ..
                                } => {
                                    tool_calls.push(ToolCall {
                                        id: id.clone(),
                                        call_type: "function".to_string(),
                                        function: ToolCallFunction {
                                            name: name.clone(),
                                            arguments: arguments_json.clone(),
                                        },
                                    });
                                }
                                // The loop decides when the whole turn is done.
                                NormalizedEvent::Done | NormalizedEvent::StreamStart { .. } => {
                                    continue;
                                }
                                NormalizedEvent::Error { .. } => {
                                    yield event;
                                    return;
                                }
                                _ => {}
                            }
                            yield event;
                        }
                        Err(e) => {
                            tracing::error!(
                                request_id = %request_id,
                                iteration = iteration,
                                error = %e,
                                "Driver stream failed"
                            );
                            yield NormalizedEvent::Error {
                                message: e.to_string(),
                                code: Some(LLM_ERROR_CODE.to_string()),
                            };
                            return;
                        }
                    }
                }

                if tool_calls.is_empty() {
                    tracing::info!(
                        request_id = %request_id,
                        iteration = iteration,
                        answer_length = assistant_text.len(),
                        "No tool calls to process, completing stream"
                    );
                    yield NormalizedEvent::Done;
                    break;
                }

                // Add assistant message with tool calls to history
                message_json.push(serde_json::json!({
                    "role": "assistant",
                    "content": if assistant_text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(assistant_text.clone()) },
                    "tool_calls": tool_calls,
                }));

                for (idx, tool_call) in tool_calls.iter().enumerate() {
                    let tool_name = &tool_call.function.name;
                    let arguments: serde_json::Value = serde_json::from_str(&tool_call.function.arguments)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

                    tracing::info!(
                        request_id = %request_id,
                        iteration = iteration,
                        tool_index = idx,
                        tool_id = %tool_call.id,
                        tool_name = %tool_name,
                        server = orchestrator.mcp.server_of(tool_name).unwrap_or("unknown"),
                        args = %preview(&tool_call.function.arguments, ARGS_PREVIEW_CHARS),
                        "Calling tool"
                    );

                    let (content, success) = match orchestrator.mcp.call_tool(tool_name, arguments).await {
                        Ok(output) if output.is_error => {
                            tracing::warn!(
                                request_id = %request_id,
                                tool_id = %tool_call.id,
                                tool_name = %tool_name,
                                result = %preview(&output.content, RESULT_PREVIEW_CHARS),
                                "Tool reported an error"
                            );
                            (format!("Error: {}", output.content), false)
                        }
                        Ok(output) => {
                            tracing::info!(
                                request_id = %request_id,
                                tool_id = %tool_call.id,
                                tool_name = %tool_name,
                                result_length = output.content.len(),
                                result = %preview(&output.content, RESULT_PREVIEW_CHARS),
                                "Tool call succeeded"
                            );
                            (output.content, true)
                        }
                        Err(e) => {
                            tracing::error!(
                                request_id = %request_id,
                                tool_id = %tool_call.id,
                                tool_name = %tool_name,
                                error = %format!("{e:#}"),
                                "Tool call failed"
                            );
                            (format!("Error: {e:#}"), false)
                        }
                    };

                    yield NormalizedEvent::ToolResult {
                        id: tool_call.id.clone(),
                        name: tool_name.clone(),
                        content: content.clone(),
                        success,
                    };

                    message_json.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_call.id,
                        "content": content
                    }));
                }

                tracing::debug!(
                    request_id = %request_id,
                    iteration = iteration,
                    "All tool calls executed, continuing to next iteration"
                );
            }
        }
    }

    /// Drain the tool loop for `messages` into a [`TurnOutcome`].
    ///
    /// # Errors
    ///
    /// [`TurnError::Llm`] when the model request fails and
    /// [`TurnError::MaxIterations`] when the loop never settles. Tool
    /// failures are not errors here; the model sees them as tool results.
    pub async fn run(&self, messages: Vec<Message>) -> Result<TurnOutcome, TurnError> {
        let stream = self.chat_with_history(messages);
        futures::pin_mut!(stream);

        let mut outcome = TurnOutcome::default();
        let mut current_text = String::new();
        let mut pending: Vec<ToolInvocation> = Vec::new();
        let mut request_id = String::new();

        while let Some(event) = stream.next().await {
            match event {
                NormalizedEvent::StreamStart { request_id: rid } => request_id = rid,
                NormalizedEvent::MessageDelta { text } => current_text.push_str(&text),
                NormalizedEvent::ThinkingDelta { text } => {
                    tracing::info!(
                        request_id = %request_id,
                        thought = %preview(&text, THOUGHT_PREVIEW_CHARS),
                        "Model thought"
                    );
                }
                NormalizedEvent::ToolCallComplete {
                    id,
                    name,
                    arguments_json,
                    ..
                } => {
                    if !current_text.trim().is_empty() {
                        tracing::info!(
                            request_id = %request_id,
                            thought = %preview(&current_text, THOUGHT_PREVIEW_CHARS),
                            "Model reasoning before tool call"
                        );
                    }
                    current_text.clear();
                    pending.push(ToolInvocation {
                        id,
                        name,
                        arguments: serde_json::from_str(&arguments_json)
                            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                        success: false,
                        result_preview: String::new(),
                    });
                }
                NormalizedEvent::ToolResult {
                    id,
                    content,
                    success,
                    ..
                } => {
                    // Text streamed after a function call belongs to a
                    // response that was not the final one.
                    if !current_text.trim().is_empty() {
                        tracing::info!(
                            request_id = %request_id,
                            thought = %preview(&current_text, THOUGHT_PREVIEW_CHARS),
                            "Model text alongside tool call"
                        );
                    }
                    current_text.clear();
                    if let Some(pos) = pending.iter().position(|p| p.id == id) {
                        let mut invocation = pending.remove(pos);
                        invocation.success = success;
                        invocation.result_preview = preview(&content, RESULT_PREVIEW_CHARS);
                        outcome.tool_calls.push(invocation);
                    }
                }
                NormalizedEvent::Error { message, code } => {
                    return Err(
                        if code.as_deref() == Some(MAX_ITERATIONS_CODE) {
                            TurnError::MaxIterations(self.max_iterations)
                        } else {
                            TurnError::Llm(message)
                        },
                    );
                }
                NormalizedEvent::Done => break,
                NormalizedEvent::ToolCallDelta { .. } => {}
            }
        }

        outcome.answer = current_text;
        Ok(outcome)
    }
}

/// First `max_chars` characters of `text`, with `...` when cut.
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::EventStream;
    use crate::mcp::registry::NativeTool;

    /// Driver that replays one scripted response per request.
    struct ScriptedDriver {
        responses: Mutex<VecDeque<anyhow::Result<Vec<NormalizedEvent>>>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedDriver {
        fn new(responses: Vec<anyhow::Result<Vec<NormalizedEvent>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmDriver for ScriptedDriver {
        async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
            self.requests.lock().unwrap().push(req);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![NormalizedEvent::Done]));
            let events = next?;
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl NativeTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type":"object","properties":{"text":{"type":"string"}}})
        }
        async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(args["text"].clone())
        }
    }

    fn tool_call(id: &str, name: &str, args: &str) -> NormalizedEvent {
        NormalizedEvent::ToolCallComplete {
            call_index: 0,
            id: id.to_string(),
            name: name.to_string(),
            arguments_json: args.to_string(),
        }
    }

    fn text(t: &str) -> NormalizedEvent {
        NormalizedEvent::MessageDelta {
            text: t.to_string(),
        }
    }

    fn registry() -> Arc<McpRegistry> {
        Arc::new(McpRegistry::new_empty().with_native_tool(Arc::new(Echo)))
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let driver = ScriptedDriver::new(vec![Ok(vec![text("Hel"), text("lo"), NormalizedEvent::Done])]);
        let orch = Orchestrator::with_driver(driver.clone(), registry(), 5);

        let outcome = orch.run(vec![Message::user("hi")]).await.unwrap();
        assert_eq!(outcome.answer, "Hello");
        assert!(outcome.tool_calls.is_empty());
        assert_eq!(driver.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let driver = ScriptedDriver::new(vec![
            Ok(vec![
                text("Let me check."),
                tool_call("c1", "echo", r#"{"text":"pong"}"#),
                NormalizedEvent::Done,
            ]),
            Ok(vec![text("It said pong."), NormalizedEvent::Done]),
        ]);
        let orch = Orchestrator::with_driver(driver.clone(), registry(), 5);

        let outcome = orch.run(vec![Message::user("ping")]).await.unwrap();
        assert_eq!(outcome.answer, "It said pong.");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "echo");
        assert!(outcome.tool_calls[0].success);
        assert_eq!(outcome.tool_calls[0].result_preview, "pong");

        let requests = driver.requests.lock().unwrap();
        let second = &requests[1].messages;
        assert_eq!(second[1]["role"], "assistant");
        assert_eq!(second[1]["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(second[2]["role"], "tool");
        assert_eq!(second[2]["tool_call_id"], "c1");
        assert_eq!(second[2]["content"], "pong");
    }

    #[tokio::test]
    async fn test_text_after_tool_call_stays_out_of_answer() {
        let driver = ScriptedDriver::new(vec![
            Ok(vec![
                tool_call("c1", "echo", r#"{"text":"pong"}"#),
                text("(calling echo)"),
                NormalizedEvent::Done,
            ]),
            Ok(vec![text("Final."), NormalizedEvent::Done]),
        ]);
        let orch = Orchestrator::with_driver(driver.clone(), registry(), 5);

        let outcome = orch.run(vec![Message::user("ping")]).await.unwrap();
        assert_eq!(outcome.answer, "Final.");
        assert_eq!(outcome.tool_calls.len(), 1);

        // The model still gets its own interim text back.
        let requests = driver.requests.lock().unwrap();
        assert_eq!(requests[1].messages[1]["content"], "(calling echo)");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back_as_error() {
        let driver = ScriptedDriver::new(vec![
            Ok(vec![tool_call("c1", "nope", "not json"), NormalizedEvent::Done]),
            Ok(vec![text("Sorry."), NormalizedEvent::Done]),
        ]);
        let orch = Orchestrator::with_driver(driver.clone(), registry(), 5);

        let outcome = orch.run(vec![Message::user("x")]).await.unwrap();
        assert_eq!(outcome.answer, "Sorry.");
        assert!(!outcome.tool_calls[0].success);
        assert_eq!(outcome.tool_calls[0].arguments, serde_json::json!({}));

        let requests = driver.requests.lock().unwrap();
        let content = requests[1].messages[2]["content"].as_str().unwrap();
        assert!(content.starts_with("Error: "));
        assert!(content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_driver_failure_is_llm_error() {
        let driver = ScriptedDriver::new(vec![Err(anyhow::anyhow!(
            "LLM request failed with HTTP 503"
        ))]);
        let orch = Orchestrator::with_driver(driver, registry(), 5);

        let err = orch.run(vec![Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, TurnError::Llm(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let looping = (0..3)
            .map(|i| Ok(vec![tool_call(&format!("c{i}"), "echo", "{}"), NormalizedEvent::Done]))
            .collect();
        let driver = ScriptedDriver::new(looping);
        let orch = Orchestrator::with_driver(driver, registry(), 2);

        let err = orch.run(vec![Message::user("x")]).await.unwrap_err();
        assert_eq!(err, TurnError::MaxIterations(2));
    }

    #[tokio::test]
    async fn test_stream_event_order() {
        let driver = ScriptedDriver::new(vec![
            Ok(vec![tool_call("c1", "echo", r#"{"text":"a"}"#), NormalizedEvent::Done]),
            Ok(vec![text("done"), NormalizedEvent::Done]),
        ]);
        let orch = Orchestrator::with_driver(driver, registry(), 5);

        let names: Vec<&'static str> = orch
            .chat_with_history(vec![Message::user("x")])
            .map(|e| event_name(&e))
            .collect()
            .await;
        assert_eq!(
            names,
            vec![
                "stream.start",
                "tool_call.complete",
                "tool_result",
                "message.delta",
                "done"
            ]
        );
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("ééé", 2), "éé...");
    }
}
