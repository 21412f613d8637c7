//! Native Gemini API driver.
//!
//! This module implements the [`LlmDriver`] trait for
//! `models/{model}:streamGenerateContent?alt=sse`. Requests arrive in the
//! Chat Completions shape and are translated into Gemini `contents`,
//! `systemInstruction` and `functionDeclarations`.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{Map, Value, json};

use crate::normalized::NormalizedEvent;

use super::{
    EventStream, LlmDriver, LlmRequest, LlmSettings, Provider, error_for_status_with_body,
    find_frame_end, frame_data,
};

/// Schema keywords Gemini's `Schema` object understands.
const SCHEMA_KEYS: &[&str] = &[
    "type",
    "format",
    "title",
    "description",
    "nullable",
    "enum",
    "items",
    "properties",
    "required",
    "anyOf",
    "minItems",
    "maxItems",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "pattern",
    "default",
];

/// Driver for the native Gemini `streamGenerateContent` API.
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl GeminiDriver {
    /// Create a new native Gemini driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: &LlmRequest) -> Value {
        let (system, contents) = to_contents(&req.messages);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.settings.temperature,
                "thinkingConfig": { "includeThoughts": true },
            },
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        let declarations = to_function_declarations(&req.tools);
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for GeminiDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = Provider::build_native_stream_url(&self.settings.base_url, &self.settings.model);
        let body = self.request_body(&req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.header("x-goog-api-key", k);
        }

        let resp = error_for_status_with_body(rb.send().await?).await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut decoder = NativeDecoder::default();

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

            yield NormalizedEvent::Done;
        };

        Ok(Box::pin(out))
    }
}

/// Decoder for `GenerateContentResponse` chunks.
#[derive(Default)]
struct NativeDecoder {
    next_index: usize,
}

impl NativeDecoder {
    fn decode(&mut self, data: &str) -> anyhow::Result<Vec<NormalizedEvent>> {
        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            anyhow::bail!("Gemini stream error: {err}");
        }
        if let Some(reason) = v
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(Value::as_str)
        {
            anyhow::bail!("Gemini blocked the prompt: {reason}");
        }

        let mut events = Vec::new();
        let parts = v["candidates"][0]["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let idx = self.next_index;
                self.next_index += 1;

                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map_or_else(
                        || format!("call_{}", uuid::Uuid::new_v4().simple()),
                        ToString::to_string,
                    );
                let args = call
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()))
                    .to_string();

                events.push(NormalizedEvent::ToolCallDelta {
                    call_index: idx,
                    id: Some(id.clone()),
                    name: Some(name.clone()),
                    arguments_delta: Some(args.clone()),
                });
                events.push(NormalizedEvent::ToolCallComplete {
                    call_index: idx,
                    id,
                    name,
                    arguments_json: args,
                });
                continue;
            }

            if let Some(text) = part.get("text").and_then(Value::as_str)
                && !text.is_empty()
            {
                let thought = part.get("thought").and_then(Value::as_bool) == Some(true);
                events.push(if thought {
                    NormalizedEvent::ThinkingDelta {
                        text: text.to_string(),
                    }
                } else {
                    NormalizedEvent::MessageDelta {
                        text: text.to_string(),
                    }
                });
            }
        }

        Ok(events)
    }
}

/// Translate Chat Completions messages into Gemini `contents`.
///
/// Returns the joined system text separately. Consecutive tool results are
/// grouped into one `user` turn of `functionResponse` parts.
fn to_contents(messages: &[Value]) -> (Option<String>, Vec<Value>) {
    let mut system = Vec::<String>::new();
    let mut contents = Vec::<Value>::new();
    let mut call_names = HashMap::<String, String>::new();
    let mut pending_responses = Vec::<Value>::new();

    for msg in messages {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or_default();
        let text = msg
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if role == "tool" {
            let call_id = msg
                .get("tool_call_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let name = call_names.get(call_id).cloned().unwrap_or_default();
            pending_responses.push(json!({
                "functionResponse": {
                    "name": name,
                    "response": { "content": text },
                }
            }));
            continue;
        }

        if !pending_responses.is_empty() {
            contents.push(json!({
                "role": "user",
                "parts": std::mem::take(&mut pending_responses),
            }));
        }

        match role {
            "system" => system.push(text.to_string()),
            "assistant" => {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for call in msg
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = call["function"]["name"].as_str().unwrap_or_default();
                    let args = call["function"]["arguments"]
                        .as_str()
                        .and_then(|a| serde_json::from_str::<Value>(a).ok())
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    call_names.insert(id.to_string(), name.to_string());
                    parts.push(json!({ "functionCall": { "name": name, "args": args } }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            _ => contents.push(json!({ "role": "user", "parts": [{ "text": text }] })),
        }
    }

    if !pending_responses.is_empty() {
        contents.push(json!({ "role": "user", "parts": pending_responses }));
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, contents)
}

/// Translate Chat Completions tool definitions into `functionDeclarations`.
fn to_function_declarations(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            let name = function.get("name")?.as_str()?;
            let mut decl = json!({
                "name": name,
                "description": function.get("description").cloned().unwrap_or(Value::Null),
            });
            if let Some(params) = function.get("parameters") {
                let schema = clean_schema(params);
                let has_properties = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .is_some_and(|p| !p.is_empty());
                if has_properties {
                    decl["parameters"] = schema;
                }
            }
            Some(decl)
        })
        .collect()
}

/// Reduce a JSON Schema to the subset Gemini accepts.
fn clean_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if !SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" => Value::Object(
                value
                    .as_object()
                    .map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), clean_schema(v)))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            "items" => clean_schema(value),
            "anyOf" => Value::Array(
                value
                    .as_array()
                    .map(|arr| arr.iter().map(clean_schema).collect())
                    .unwrap_or_default(),
            ),
            // ["string", "null"] becomes "string" + nullable
            "type" if value.is_array() => {
                let types: Vec<&str> = value
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .collect();
                if types.contains(&"null") {
                    out.insert("nullable".to_string(), Value::Bool(true));
                }
                types
                    .into_iter()
                    .find(|t| *t != "null")
                    .map_or(Value::String("string".to_string()), |t| {
                        Value::String(t.to_string())
                    })
            }
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}
