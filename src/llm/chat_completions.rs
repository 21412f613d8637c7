//! OpenAI-compatible Chat Completions driver.
//!
//! This module implements the [`LlmDriver`] trait for Chat Completions
//! streaming, which Gemini exposes under `/v1beta/openai/chat/completions`.

use std::collections::BTreeMap;

use futures::StreamExt;

use crate::normalized::NormalizedEvent;

use super::{
    EventStream, LlmDriver, LlmRequest, LlmSettings, error_for_status_with_body, find_frame_end,
    frame_data,
};

/// Accumulated state for a streaming tool call.
#[derive(Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Driver for OpenAI-compatible Chat Completions.
///
/// Streams responses as [`NormalizedEvent`]s.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "temperature": self.settings.temperature,
            "messages": req.messages,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = self.settings.provider.build_chat_url(&self.settings.base_url);
        let body = self.request_body(req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = error_for_status_with_body(rb.send().await?).await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut decoder = ChunkDecoder::default();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some((pos, sep)) = find_frame_end(&buf) {
                    let frame = buf.drain(..pos + sep).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);
                    if let Some(data) = frame_data(&text) {
                        for event in decoder.decode(&data)? {
                            yield event;
                        }
                    }
                }
            }

            // Streams that end without `[DONE]` still finish their tool calls.
            for event in decoder.finish() {
                yield event;
            }
        };

        Ok(Box::pin(out))
    }
}

/// Incremental decoder from Chat Completions chunks to normalized events.
#[derive(Default)]
struct ChunkDecoder {
    tool_accum: BTreeMap<usize, ToolAccum>,
    completed: bool,
    done: bool,
}

impl ChunkDecoder {
    fn decode(&mut self, data: &str) -> anyhow::Result<Vec<NormalizedEvent>> {
        let mut events = Vec::new();

        if data == "[DONE]" {
            events.extend(self.finish());
            return Ok(events);
        }

        let v: serde_json::Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            anyhow::bail!("LLM stream error: {err}");
        }

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        // Assistant text delta
        if let Some(s) = delta.get("content").and_then(|x| x.as_str())
            && !s.is_empty()
        {
            events.push(NormalizedEvent::MessageDelta {
                text: s.to_string(),
            });
        }

        // Tool calls streaming deltas
        if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
            for (pos, tc) in arr.iter().enumerate() {
                let idx = tc
                    .get("index")
                    .and_then(serde_json::Value::as_u64)
                    .map_or(pos, |i| i as usize);
                let id = tc
                    .get("id")
                    .and_then(|x| x.as_str())
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string);
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);
                let args_delta = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);

                let entry = self.tool_accum.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id.clone_from(&id);
                }
                if entry.name.is_none() {
                    entry.name.clone_from(&name);
                }
                if let Some(ad) = &args_delta {
                    entry.args.push_str(ad);
                }

                events.push(NormalizedEvent::ToolCallDelta {
                    call_index: idx,
                    id,
                    name,
                    arguments_delta: args_delta,
                });
            }
        }

        // Completion boundary: some backends report "stop" even with tool calls,
        // so any finish reason closes the accumulated calls.
        if choice
            .get("finish_reason")
            .and_then(|x| x.as_str())
            .is_some()
        {
            events.extend(self.complete_tool_calls());
        }

        Ok(events)
    }

    fn complete_tool_calls(&mut self) -> Vec<NormalizedEvent> {
        if self.completed {
            return Vec::new();
        }
        self.completed = true;

        self.tool_accum
            .iter()
            .filter_map(|(idx, a)| {
                let name = a.name.clone()?;
                Some(NormalizedEvent::ToolCallComplete {
                    call_index: *idx,
                    id: a.id.clone().unwrap_or_else(|| format!("call_{idx}")),
                    name,
                    arguments_json: if a.args.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        a.args.clone()
                    },
                })
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<NormalizedEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.complete_tool_calls();
        self.done = true;
        events.push(NormalizedEvent::Done);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_chunks() {
        let mut d = ChunkDecoder::default();
        let events = d
            .decode(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(
            events,
            vec![NormalizedEvent::MessageDelta {
                text: "Hel".to_string()
            }]
        );

        let events = d.decode("[DONE]").unwrap();
        assert_eq!(events, vec![NormalizedEvent::Done]);
        assert!(d.finish().is_empty());
    }

    #[test]
    fn test_streamed_tool_call_assembly() {
        let mut d = ChunkDecoder::default();
        d.decode(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"search_papers","arguments":"{\"topic\":"}}]}}]}"#)
            .unwrap();
        d.decode(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"transformers\"}"}}]}}]}"#)
            .unwrap();
        let events = d
            .decode(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();

        assert_eq!(
            events,
            vec![NormalizedEvent::ToolCallComplete {
                call_index: 0,
                id: "call_a".to_string(),
                name: "search_papers".to_string(),
                arguments_json: r#"{"topic":"transformers"}"#.to_string(),
            }]
        );

        // [DONE] does not repeat the completion.
        assert_eq!(d.decode("[DONE]").unwrap(), vec![NormalizedEvent::Done]);
    }

    #[test]
    fn test_tool_call_without_index_or_id() {
        let mut d = ChunkDecoder::default();
        let events = d
            .decode(r#"{"choices":[{"delta":{"tool_calls":[{"function":{"name":"a","arguments":""}},{"function":{"name":"b","arguments":"{\"x\":1}"}}]},"finish_reason":"stop"}]}"#)
            .unwrap();
        let completes: Vec<_> = events
            .into_iter()
            .filter(|e| matches!(e, NormalizedEvent::ToolCallComplete { .. }))
            .collect();
        assert_eq!(
            completes,
            vec![
                NormalizedEvent::ToolCallComplete {
                    call_index: 0,
                    id: "call_0".to_string(),
                    name: "a".to_string(),
                    arguments_json: "{}".to_string(),
                },
                NormalizedEvent::ToolCallComplete {
                    call_index: 1,
                    id: "call_1".to_string(),
                    name: "b".to_string(),
                    arguments_json: r#"{"x":1}"#.to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_error_payload() {
        let mut d = ChunkDecoder::default();
        assert!(d.decode(r#"{"error":{"message":"quota"}}"#).is_err());
    }

    #[test]
    fn test_request_body_omits_empty_tools() {
        let driver = ChatCompletionsDriver::new(LlmSettings {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.7,
            protocol: super::super::LlmProtocol::Chat,
            provider: super::super::Provider::Gemini,
        });
        let body = driver.request_body(LlmRequest {
            messages: vec![serde_json::json!({"role":"user","content":"hi"})],
            tools: vec![],
        });
        assert!(body.get("tools").is_none());
        assert_eq!(body["model"], "gemini-2.5-flash");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }
}
