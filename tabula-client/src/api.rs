//! HTTP client for the Tabula server.
//!
//! Every request carries the opaque `X-Client-Id` header the server scopes
//! sessions by. At most one chat request is in flight at a time; a second
//! attempt is rejected before any network call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabula_core::models::{Session, Table};
use thiserror::Error;

pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("the previous message has not finished yet, try again later")]
    Busy,
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub chat_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_time: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatResponse {
    pub reply: String,
    pub tables: Vec<Table>,
    pub session_id: String,
    pub user_message_id: String,
    pub bot_message_id: String,
    pub session: Option<Session>,
}

#[derive(Debug, Deserialize)]
struct SessionsPayload {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: Session,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    chat_in_flight: AtomicBool,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_client_id(base_url, &format!("client_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn with_client_id(base_url: &str, client_id: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            chat_in_flight: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let payload: ErrorPayload = response.json().await.unwrap_or_default();
        let message = if payload.error.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            payload.error
        };
        tracing::debug!(status = status.as_u16(), %message, "server rejected the request");
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn fetch_sessions(&self) -> Result<Vec<Session>, ApiError> {
        let response = self
            .http
            .get(self.url("/api/sessions"))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .send()
            .await?;
        let payload: SessionsPayload = Self::check(response).await?.json().await?;
        Ok(payload.sessions)
    }

    /// `None` on 404, so absent and foreign sessions look the same.
    pub async fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, ApiError> {
        let response = self
            .http
            .get(self.url(&format!("/api/sessions/{session_id}")))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: SessionPayload = Self::check(response).await?.json().await?;
        Ok(Some(payload.session))
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<Session, ApiError> {
        let mut body = serde_json::json!({ "clientId": self.client_id });
        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            body["title"] = serde_json::json!(title);
        }
        let response = self
            .http
            .post(self.url("/api/sessions"))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .json(&body)
            .send()
            .await?;
        let payload: SessionPayload = Self::check(response).await?.json().await?;
        Ok(payload.session)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/sessions/{session_id}")))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// One chat turn. Rejected with [`ApiError::Busy`] while another turn is
    /// still in flight; the slot is released on every exit path.
    pub async fn post_chat(&self, turn: &ChatTurn) -> Result<ChatResponse, ApiError> {
        if self
            .chat_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ApiError::Busy);
        }
        let _slot = InFlightSlot(&self.chat_in_flight);

        let response = self
            .http
            .post(self.url("/api/chat"))
            .header(CLIENT_ID_HEADER, &self.client_id)
            .json(turn)
            .send()
            .await?;
        let payload: ChatResponse = Self::check(response).await?.json().await?;
        Ok(payload)
    }
}

struct InFlightSlot<'a>(&'a AtomicBool);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn every_request_carries_the_client_id_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header(CLIENT_ID_HEADER, "client_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessions": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::with_client_id(&server.uri(), "client_test").unwrap();
        let sessions = client.fetch_sessions().await.unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn fetch_session_maps_not_found_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "session not found"})),
            )
            .mount(&server)
            .await;

        let client = ApiClient::with_client_id(&server.uri(), "client_test").unwrap();
        assert!(client.fetch_session("sess_x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_body_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"error": "busy", "sessionId": "sess_x"})),
            )
            .mount(&server)
            .await;

        let client = ApiClient::with_client_id(&server.uri(), "client_test").unwrap();
        let err = client
            .post_chat(&ChatTurn {
                chat_input: "hi".to_string(),
                ..ChatTurn::default()
            })
            .await
            .unwrap_err();
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_chat_is_rejected_before_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"reply": "ok", "sessionId": "sess_a"}))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let client = ApiClient::with_client_id(&server.uri(), "client_test").unwrap();
        let turn = ChatTurn {
            chat_input: "hi".to_string(),
            ..ChatTurn::default()
        };

        let first = client.post_chat(&turn);
        let second = async {
            // Let the first call win the slot before attempting.
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.post_chat(&turn).await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().reply, "ok");
        assert!(matches!(second.unwrap_err(), ApiError::Busy));

        // The slot is free again after completion.
        assert_eq!(client.post_chat(&turn).await.unwrap().reply, "ok");
    }
}
