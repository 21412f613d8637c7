use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use gemini_mcp_chat::AppState;
use gemini_mcp_chat::agent::Agent;
use gemini_mcp_chat::config::{
    AgentConfig, AppConfig, HttpConfig, LoggingConfig, McpSettings, ModelConfig, SessionConfig,
};
use gemini_mcp_chat::llm::{EventStream, LlmDriver, LlmRequest, Orchestrator};
use gemini_mcp_chat::mcp::registry::McpRegistry;
use gemini_mcp_chat::normalized::NormalizedEvent;
use gemini_mcp_chat::server::router;
use serde_json::{Value, json};
use tower::ServiceExt;

struct CannedDriver {
    answers: Mutex<VecDeque<anyhow::Result<String>>>,
}

#[async_trait]
impl LlmDriver for CannedDriver {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<EventStream> {
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))?;
        let events = vec![
            Ok(NormalizedEvent::MessageDelta { text: answer }),
            Ok(NormalizedEvent::Done),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        server: HttpConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
        },
        model: ModelConfig {
            name: "gemini-2.5-flash".to_string(),
            temperature: 0.7,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            protocol: "auto".to_string(),
        },
        agent: AgentConfig {
            system_prompt: Some("Be brief.".to_string()),
            system_prompt_file: None,
            max_tool_iterations: 10,
            turn_timeout_secs: 5,
        },
        mcp: McpSettings {
            config_path: PathBuf::from("mcp.json"),
            connect_timeout_secs: 5,
        },
        sessions: SessionConfig {
            idle_timeout_secs: 60,
        },
        logging: LoggingConfig { json: false },
    }
}

fn app(answers: Vec<anyhow::Result<String>>) -> (Router, Agent) {
    let driver = Arc::new(CannedDriver {
        answers: Mutex::new(answers.into()),
    });
    let orchestrator = Orchestrator::with_driver(driver, Arc::new(McpRegistry::new_empty()), 10);
    let agent = Agent::new(orchestrator, "Be brief.", Duration::from_secs(5));
    let state = AppState {
        agent: agent.clone(),
        config: Arc::new(test_config()),
    };
    (router(state), agent)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_index_serves_chat_widget() {
    let (app, _) = app(vec![]);
    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    let html = body.as_str().unwrap();
    assert!(html.contains("<title>Research Assistant</title>"));
    assert!(html.contains("New Chat"));
}

#[tokio::test]
async fn test_health_reports_model_and_tools() {
    let (app, _) = app(vec![]);
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tools"], 0);
    assert_eq!(body["model"], "gemini-2.5-flash");
}

#[tokio::test]
async fn test_tools_listing_is_empty_without_servers() {
    let (app, _) = app(vec![]);
    let (status, body) = send(&app, get("/api/tools")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tools"], json!([]));
    assert_eq!(body["report"]["failed"], json!([]));
}

#[tokio::test]
async fn test_chat_creates_session_and_records_history() {
    let (app, agent) = app(vec![Ok(
        "Here you go: https://img.example.org/diagram.webp".to_string()
    )]);

    let (status, body) = send(&app, post_json("/api/chat", &json!({ "message": "draw it" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["images"], json!(["https://img.example.org/diagram.webp"]));
    assert!(body["display_text"].as_str().unwrap().contains("![Generated Image]"));

    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert!(agent.sessions().get(&session_id).is_some());

    let (status, messages) = send(&app, get(&format!("/api/sessions/{session_id}/messages"))).await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "draw it");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn test_chat_continues_existing_session() {
    let (app, agent) = app(vec![Ok("one".to_string()), Ok("two".to_string())]);

    let (_, first) = send(&app, post_json("/api/chat", &json!({ "message": "a" }))).await;
    let session_id = first["session_id"].as_str().unwrap();

    let (status, second) = send(
        &app,
        post_json("/api/chat", &json!({ "message": "b", "session_id": session_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["session_id"], session_id);
    assert_eq!(agent.sessions().len(), 1);
    assert_eq!(agent.sessions().get(session_id).unwrap().message_count(), 4);
}

#[tokio::test]
async fn test_chat_rejects_empty_message() {
    let (app, agent) = app(vec![]);
    let (status, body) = send(&app, post_json("/api/chat", &json!({ "message": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "EMPTY_MESSAGE");
    assert!(body["session_id"].is_null());
    assert!(agent.sessions().is_empty());

    // A blank message for a not-yet-known id does not create it either.
    let (status, body) = send(
        &app,
        post_json("/api/chat", &json!({ "message": "", "session_id": "tab-7" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["session_id"], "tab-7");
    assert!(agent.sessions().get("tab-7").is_none());
}

#[tokio::test]
async fn test_chat_reports_model_failure() {
    let (app, agent) = app(vec![Err(anyhow::anyhow!("upstream exploded"))]);
    let (status, body) = send(&app, post_json("/api/chat", &json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "LLM_ERROR");
    assert!(body["error"].as_str().unwrap().contains("upstream exploded"));

    let session = agent
        .sessions()
        .get(body["session_id"].as_str().unwrap())
        .unwrap();
    assert_eq!(session.message_count(), 0);
}

#[tokio::test]
async fn test_session_create_and_delete() {
    let (app, agent) = app(vec![]);

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["session_id"].as_str().unwrap().to_string();
    assert!(agent.sessions().get(&id).is_some());

    let delete = |id: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{id}"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app, delete(&id)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(agent.sessions().get(&id).is_none());

    let (status, _) = send(&app, delete(&id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_messages_for_unknown_session_is_404() {
    let (app, _) = app(vec![]);
    let (status, _) = send(&app, get("/api/sessions/nope/messages")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
