//! Tabula HTTP REST API
//!
//! Axum-based HTTP server exposing session management and the chat turn.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! pure inner function. The inner functions are directly testable without
//! axum dispatch machinery.
//!
//! Endpoints:
//! - GET    /api/config       — row limits and engine host display
//! - GET    /api/sessions     — all sessions of one client, messages attached
//! - POST   /api/sessions     — create a session
//! - GET    /api/sessions/:id — one session with messages
//! - DELETE /api/sessions/:id — ownership-checked delete
//! - POST   /api/chat         — one full chat turn through the engine

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tabula_core::extract::{self, RowLimits};
use tabula_core::TabulaError;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::locks::{SessionLockGuard, SessionLocks};
use crate::pipeline::{self, MessagePipeline};
use crate::upstream::UpstreamClient;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub pipeline: MessagePipeline,
    pub locks: Arc<SessionLocks>,
    pub upstream: Arc<UpstreamClient>,
    pub limits: RowLimits,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/api/config", get(config_handler))
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route(
            "/api/sessions/:id",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/api/chat", post(chat_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    host: &str,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Tabula HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    pub chat_input: Option<String>,
    /// Accepted alias for `chatInput`.
    pub message: Option<String>,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub message_time: Option<i64>,
    pub client_id: Option<String>,
}

impl ChatRequest {
    fn input(&self) -> &str {
        self.chat_input
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
    pub client_id: Option<String>,
}

/// Client identifier: `X-Client-Id` header first, then the body field.
pub fn resolve_client_id(headers: &HeaderMap, body_value: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    from_header
        .or(body_value)
        .and_then(|raw| pipeline::normalize_owner(raw).ok())
}

fn missing_client_id() -> (StatusCode, Value) {
    (
        StatusCode::BAD_REQUEST,
        json!({"error": "client identifier is required"}),
    )
}

fn error_response(err: &TabulaError) -> (StatusCode, Value) {
    let status = match err {
        TabulaError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TabulaError::SessionNotFound | TabulaError::OwnershipMismatch { .. } => {
            StatusCode::NOT_FOUND
        }
        TabulaError::UpstreamBusy { .. } => StatusCode::TOO_MANY_REQUESTS,
        TabulaError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, json!({"error": err.to_string()}))
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner config — row limits plus engine host display (pure, no IO).
pub fn config_inner(state: &HttpState) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "engineHost": state.upstream.host_display(),
            "configured": state.upstream.is_configured(),
            "tableDefaultRows": state.limits.default_rows,
            "tableMaxRows": state.limits.max_rows,
        }),
    )
}

pub async fn list_sessions_inner(
    state: &HttpState,
    client_id: Option<String>,
) -> (StatusCode, Value) {
    let Some(owner) = client_id else {
        return missing_client_id();
    };
    match state.pipeline.list_sessions(&owner).await {
        Ok(sessions) => (StatusCode::OK, json!({"sessions": sessions})),
        Err(e) => error_response(&e),
    }
}

pub async fn create_session_inner(
    state: &HttpState,
    client_id: Option<String>,
    title: Option<String>,
) -> (StatusCode, Value) {
    let Some(owner) = client_id else {
        return missing_client_id();
    };
    match state.pipeline.create_session(&owner, title.as_deref()).await {
        Ok(session) => (StatusCode::CREATED, json!({"session": session})),
        Err(e) => error_response(&e),
    }
}

pub async fn get_session_inner(
    state: &HttpState,
    client_id: Option<String>,
    session_id: &str,
) -> (StatusCode, Value) {
    let Some(owner) = client_id else {
        return missing_client_id();
    };
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "session id is required"}),
        );
    }
    match state.pipeline.get_session_with_messages(session_id, &owner).await {
        Ok(Some(session)) => (StatusCode::OK, json!({"session": session})),
        // Foreign ownership is indistinguishable from absence to the caller.
        Ok(None) | Err(TabulaError::OwnershipMismatch { .. }) => (
            StatusCode::NOT_FOUND,
            json!({"error": "session not found"}),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_session_inner(
    state: &HttpState,
    client_id: Option<String>,
    session_id: &str,
) -> (StatusCode, Value) {
    let Some(owner) = client_id else {
        return missing_client_id();
    };
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "session id is required"}),
        );
    }
    match state.pipeline.delete_session(session_id, &owner).await {
        Ok(true) => (StatusCode::OK, json!({"deleted": true})),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            json!({"error": "session not found"}),
        ),
        Err(e) => error_response(&e),
    }
}

fn busy_response(session_id: &str) -> (StatusCode, Value) {
    let err = TabulaError::UpstreamBusy {
        session_id: session_id.to_string(),
    };
    let (status, mut body) = error_response(&err);
    body["sessionId"] = json!(session_id);
    (status, body)
}

/// Inner chat — one full turn: lock, persist the user message, call the
/// engine, extract and sanitize tables, persist the bot message, return the
/// refreshed session.
pub async fn chat_inner(
    state: &HttpState,
    client_id: Option<String>,
    req: ChatRequest,
) -> (StatusCode, Value) {
    let Some(owner) = client_id else {
        return missing_client_id();
    };
    let input = req.input().trim().to_string();
    if input.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "message text is required"}),
        );
    }

    let mut session_id = req
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(pipeline::gen_session_id);

    // Guards are held for the full turn, upstream round trip included. The
    // ownership fallback below may add a second guard for the replacement id.
    let mut guards: Vec<SessionLockGuard> = Vec::new();
    match state.locks.try_acquire(&session_id) {
        Some(guard) => guards.push(guard),
        None => return busy_response(&session_id),
    }

    // Get-or-create; a session held by another client is replaced with a
    // fresh one instead of leaking across owners.
    match state.pipeline.ensure_session(&session_id, &owner).await {
        Ok(_) => {}
        Err(TabulaError::OwnershipMismatch { .. }) => {
            let replacement = match state.pipeline.create_session(&owner, None).await {
                Ok(session) => session,
                Err(e) => return error_response(&e),
            };
            tracing::info!(
                old = %session_id,
                new = %replacement.id,
                "session owned by another client, allocated a replacement"
            );
            session_id = replacement.id;
            match state.locks.try_acquire(&session_id) {
                Some(guard) => guards.push(guard),
                None => return busy_response(&session_id),
            }
        }
        Err(e) => return error_response(&e),
    }

    let user_message_id = match state
        .pipeline
        .add_user_message(
            &session_id,
            &owner,
            req.message_id.as_deref(),
            &input,
            req.message_time,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    let payload = json!({
        "chatInput": input,
        "sessionId": session_id,
        "messageId": user_message_id,
        "clientId": owner,
    });
    let raw = match state.upstream.send_chat(&payload).await {
        Ok(raw) => raw,
        Err(TabulaError::UpstreamFailure { status, detail }) => {
            return (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": format!("engine request failed: status {status}"),
                    "details": detail,
                    "sessionId": session_id,
                }),
            );
        }
        Err(e) => return error_response(&e),
    };

    // Wrapped non-2xx statuses inside the reply body are also terminal.
    let reply = match extract::extract_reply(&raw, &state.limits) {
        Ok(reply) => reply,
        Err(TabulaError::UpstreamFailure { status, detail }) => {
            return (
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": format!("engine reported an error: status {status}"),
                    "details": detail,
                    "sessionId": session_id,
                }),
            );
        }
        Err(e) => return error_response(&e),
    };

    let (bot_message_id, tables) = match state
        .pipeline
        .add_bot_message(&session_id, &owner, &reply.text, &reply.tables)
        .await
    {
        Ok(out) => out,
        Err(e) => return error_response(&e),
    };

    let session = match state
        .pipeline
        .get_session_with_messages(&session_id, &owner)
        .await
    {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    (
        StatusCode::OK,
        json!({
            "reply": reply.text,
            "tables": tables,
            "sessionId": session_id,
            "userMessageId": user_message_id,
            "botMessageId": bot_message_id,
            "session": session,
        }),
    )
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn config_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = config_inner(&state);
    (status, Json(body))
}

pub async fn list_sessions_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let client_id = resolve_client_id(&headers, None);
    let (status, body) = list_sessions_inner(&state, client_id).await;
    (status, Json(body))
}

pub async fn create_session_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let client_id = resolve_client_id(&headers, req.client_id.as_deref());
    let (status, body) = create_session_inner(&state, client_id, req.title).await;
    (status, Json(body))
}

pub async fn get_session_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let client_id = resolve_client_id(&headers, None);
    let (status, body) = get_session_inner(&state, client_id, &id).await;
    (status, Json(body))
}

pub async fn delete_session_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let client_id = resolve_client_id(&headers, None);
    let (status, body) = delete_session_inner(&state, client_id, &id).await;
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<ChatRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let client_id = resolve_client_id(&headers, req.client_id.as_deref());
    let (status, body) = chat_inner(&state, client_id, req).await;
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RetentionLimits;
    use crate::repo::MemorySessionRepo;
    use tabula_core::config::UpstreamConfig;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_for(webhook_url: &str) -> Arc<HttpState> {
        let limits = RowLimits {
            default_rows: 30,
            max_rows: 200,
        };
        let upstream = UpstreamClient::new(&UpstreamConfig {
            webhook_url: webhook_url.to_string(),
            api_key: None,
            timeout_seconds: 5,
        })
        .unwrap();
        Arc::new(HttpState {
            pipeline: MessagePipeline::new(
                Arc::new(MemorySessionRepo::new()),
                RetentionLimits {
                    max_messages_per_session: 200,
                    max_sessions_per_owner: 100,
                },
                limits.max_rows,
            ),
            locks: SessionLocks::new(),
            upstream: Arc::new(upstream),
            limits,
        })
    }

    fn chat_req(input: &str, session_id: Option<&str>) -> ChatRequest {
        ChatRequest {
            chat_input: Some(input.to_string()),
            session_id: session_id.map(str::to_string),
            ..ChatRequest::default()
        }
    }

    async fn engine_with(body: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    // 1. A full chat turn persists both messages and returns the session.
    #[tokio::test]
    async fn chat_turn_end_to_end() {
        let engine = engine_with(json!({
            "text": "here you go",
            "result": [{"region": "east", "revenue": 100}],
        }))
        .await;
        let state = state_for(&engine.uri());

        let (status, body) =
            chat_inner(&state, Some("alice".to_string()), chat_req("show revenue", None)).await;
        assert_eq!(status, StatusCode::OK);
        // The reply text carries the markdown rendition after the prose.
        let reply = body["reply"].as_str().unwrap();
        assert!(reply.starts_with("here you go"));
        assert!(reply.contains("| region | revenue |"));
        assert_eq!(body["tables"].as_array().unwrap().len(), 1);
        assert_eq!(body["tables"][0]["headers"], json!(["region", "revenue"]));

        let session = &body["session"];
        assert_eq!(session["title"], "show revenue");
        let messages = session["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "bot");
        assert_eq!(messages[1]["tableSummary"][0]["totalRows"], 1);
    }

    // 2. Missing client id is rejected before any work happens.
    #[tokio::test]
    async fn chat_requires_a_client_id() {
        let state = state_for("http://localhost:1");
        let (status, body) = chat_inner(&state, None, chat_req("hello", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("client identifier"));
    }

    // 3. Blank input is rejected.
    #[tokio::test]
    async fn chat_requires_message_text() {
        let state = state_for("http://localhost:1");
        let (status, _) =
            chat_inner(&state, Some("alice".to_string()), chat_req("   ", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // 4. A locked session yields 429 immediately; once the lock is released
    //    the next attempt succeeds.
    #[tokio::test]
    async fn concurrent_turns_on_one_session_are_rejected() {
        let engine = engine_with(json!({"text": "done"})).await;
        let state = state_for(&engine.uri());

        let guard = state.locks.try_acquire("sess_busy").unwrap();
        let (status, body) = chat_inner(
            &state,
            Some("alice".to_string()),
            chat_req("first", Some("sess_busy")),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["sessionId"], "sess_busy");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("still being processed"));

        drop(guard);
        let (status, _) = chat_inner(
            &state,
            Some("alice".to_string()),
            chat_req("second", Some("sess_busy")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // 5. Engine transport failure maps to 502 and carries the session id.
    #[tokio::test]
    async fn engine_failure_maps_to_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let state = state_for(&server.uri());

        let (status, body) =
            chat_inner(&state, Some("alice".to_string()), chat_req("hello", None)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["sessionId"].as_str().unwrap().starts_with("sess_"));
        assert_eq!(body["details"], "boom");
    }

    // 6. A wrapped error status inside a 200 reply is still terminal.
    #[tokio::test]
    async fn wrapped_engine_error_maps_to_bad_gateway() {
        let engine = engine_with(json!({
            "response": {"statusCode": 500, "body": "workflow crashed"}
        }))
        .await;
        let state = state_for(&engine.uri());

        let (status, _) =
            chat_inner(&state, Some("alice".to_string()), chat_req("hello", None)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    // 7. A session id owned by another client gets a transparent replacement.
    #[tokio::test]
    async fn foreign_session_is_replaced_in_flight() {
        let engine = engine_with(json!({"text": "fresh start"})).await;
        let state = state_for(&engine.uri());

        let (_, created) =
            create_session_inner(&state, Some("alice".to_string()), None).await;
        let stolen_id = created["session"]["id"].as_str().unwrap().to_string();

        let (status, body) = chat_inner(
            &state,
            Some("bob".to_string()),
            chat_req("hello", Some(&stolen_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let new_id = body["sessionId"].as_str().unwrap();
        assert_ne!(new_id, stolen_id);

        // Alice's session is untouched.
        let (status, body) =
            get_session_inner(&state, Some("alice".to_string()), &stolen_id).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["session"]["messages"].as_array().unwrap().is_empty());
    }

    // 8. Session CRUD round trip through the inner functions.
    #[tokio::test]
    async fn session_crud_round_trip() {
        let state = state_for("http://localhost:1");
        let owner = Some("alice".to_string());

        let (status, created) =
            create_session_inner(&state, owner.clone(), Some("  Quarterly  ".to_string())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["session"]["title"], "Quarterly");
        let id = created["session"]["id"].as_str().unwrap().to_string();

        let (status, listed) = list_sessions_inner(&state, owner.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

        // Another client sees neither the list entry nor the session.
        let (_, other) = list_sessions_inner(&state, Some("bob".to_string())).await;
        assert!(other["sessions"].as_array().unwrap().is_empty());
        let (status, _) = get_session_inner(&state, Some("bob".to_string()), &id).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = delete_session_inner(&state, Some("bob".to_string()), &id).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = delete_session_inner(&state, owner.clone(), &id).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_session_inner(&state, owner, &id).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // 9. Config endpoint exposes limits and the engine host only.
    #[tokio::test]
    async fn config_reports_limits_and_host() {
        let state = state_for("https://engine.example.com/hook/abc");
        let (status, body) = config_inner(&state);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engineHost"], "engine.example.com");
        assert_eq!(body["configured"], true);
        assert_eq!(body["tableDefaultRows"], 30);
        assert_eq!(body["tableMaxRows"], 200);
    }

    #[test]
    fn client_id_header_wins_over_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, "header-client".parse().unwrap());
        assert_eq!(
            resolve_client_id(&headers, Some("body-client")).as_deref(),
            Some("header-client")
        );
        assert_eq!(
            resolve_client_id(&HeaderMap::new(), Some("  body-client  ")).as_deref(),
            Some("body-client")
        );
        assert_eq!(resolve_client_id(&HeaderMap::new(), Some("   ")), None);
        assert_eq!(resolve_client_id(&HeaderMap::new(), None), None);
    }
}
