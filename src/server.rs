use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::agent::{Agent, TurnReply};
use crate::config::AppConfig;
use crate::error::TurnError;
use crate::llm::orchestrator::preview;
use crate::mcp::registry::AssemblyReport;

const INDEX_HTML: &str = include_str!("../assets/index.html");

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the Axum server for an assembled agent.
pub async fn start_server(config: Arc<AppConfig>, agent: Agent) -> anyhow::Result<()> {
    spawn_session_sweeper(
        agent.clone(),
        Duration::from_secs(config.sessions.idle_timeout_secs),
    );

    let app = router(AppState {
        agent,
        config: Arc::clone(&config),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(name: "server.stopped", "Server shut down");
    Ok(())
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/tools", get(api_tools))
        .route("/api/chat", post(api_chat))
        .route("/api/sessions", post(api_new_session))
        .route("/api/sessions/{id}", delete(api_delete_session))
        .route("/api/sessions/{id}/messages", get(api_get_messages))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_session_sweeper(agent: Agent, idle_timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = agent.sessions().cleanup_expired(idle_timeout);
            if removed > 0 {
                info!(
                    removed = removed,
                    remaining = agent.sessions().len(),
                    "Expired idle chat sessions"
                );
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET / - Chat widget.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "tools": state.agent.registry().len(),
        "model": state.config.model.name,
    }))
}

/// Tool DTO for API responses.
#[derive(Debug, Serialize)]
struct ToolDto {
    name: String,
    server: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct ToolsResponse {
    tools: Vec<ToolDto>,
    report: AssemblyReport,
}

/// GET /api/tools - Exposed tools and the startup assembly report.
async fn api_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let registry = state.agent.registry();
    let tools = registry
        .tools()
        .map(|(name, tool)| ToolDto {
            name: name.to_string(),
            server: registry.server_of(name).unwrap_or_default().to_string(),
            description: tool.description.as_deref().unwrap_or_default().to_string(),
        })
        .collect();

    Json(ToolsResponse {
        tools,
        report: registry.report().clone(),
    })
}

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// User message content.
    message: String,
    /// Optional session ID (creates new if not provided).
    #[serde(default)]
    session_id: Option<String>,
}

/// A failed turn, reported with the session it belongs to (if any).
#[derive(Debug)]
struct ChatError {
    error: TurnError,
    session_id: Option<String>,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.error.to_string(),
            "code": self.error.code(),
            "session_id": self.session_id,
        }));
        (self.error.status_code(), body).into_response()
    }
}

/// POST /api/chat - Run one turn and return the display-ready answer.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnReply>, ChatError> {
    tracing::info!(
        message = %preview(&req.message, 100),
        session_id = ?req.session_id,
        "Received chat request"
    );

    let requested_id = req
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    // Blank submits never create a session.
    if req.message.trim().is_empty() {
        return Err(ChatError {
            error: TurnError::EmptyMessage,
            session_id: requested_id.map(str::to_string),
        });
    }

    let session = match requested_id {
        Some(id) => state.agent.sessions().get_or_create(id),
        None => state.agent.new_session(),
    };

    state
        .agent
        .handle_turn(&session, &req.message)
        .await
        .map(Json)
        .map_err(|error| ChatError {
            error,
            session_id: Some(session.id().to_string()),
        })
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: String,
    created_at: String,
}

/// POST /api/sessions - Start a new chat.
async fn api_new_session(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.agent.new_session();
    (
        StatusCode::CREATED,
        Json(SessionCreated {
            session_id: session.id().to_string(),
            created_at: session.created_at().to_rfc3339(),
        }),
    )
}

/// DELETE /api/sessions/:id - Drop a session and its history.
async fn api_delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.agent.sessions().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

/// Message DTO for API responses.
#[derive(Debug, Serialize)]
struct MessageDto {
    role: String,
    content: String,
}

/// GET /api/sessions/:id/messages - Get session messages.
async fn api_get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageDto>>, StatusCode> {
    match state.agent.sessions().get(&id) {
        Some(session) => {
            let messages: Vec<MessageDto> = session
                .messages()
                .iter()
                .map(|m| MessageDto {
                    role: format!("{:?}", m.role).to_lowercase(),
                    content: m.content.clone(),
                })
                .collect();
            Ok(Json(messages))
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}
