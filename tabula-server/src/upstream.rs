//! HTTP client for the automation-engine webhook.

use std::time::Duration;

use serde_json::Value;
use tabula_core::config::UpstreamConfig;
use tabula_core::TabulaError;
use tracing::{debug, warn};

pub struct UpstreamClient {
    client: reqwest::Client,
    webhook_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, TabulaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| TabulaError::Other(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            webhook_url: cfg.webhook_url.trim().to_string(),
            api_key: cfg
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    /// Host portion of the webhook url, for config introspection. The full
    /// url stays server-side.
    pub fn host_display(&self) -> String {
        reqwest::Url::parse(&self.webhook_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unconfigured".to_string())
    }

    /// Posts one chat payload and returns the raw JSON reply. Timeouts map
    /// to status 504, other transport failures to 502, and non-2xx replies
    /// carry the upstream status and body.
    pub async fn send_chat(&self, payload: &Value) -> Result<Value, TabulaError> {
        if !self.is_configured() {
            return Err(TabulaError::UpstreamFailure {
                status: 502,
                detail: "webhook url is not configured".to_string(),
            });
        }

        let mut request = self.client.post(&self.webhook_url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            let status = if e.is_timeout() { 504 } else { 502 };
            warn!(status, "webhook request failed: {e}");
            TabulaError::UpstreamFailure {
                status,
                detail: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "webhook returned an error body");
            return Err(TabulaError::UpstreamFailure {
                status: status.as_u16(),
                detail,
            });
        }

        debug!(status = status.as_u16(), "webhook reply received");
        response
            .json::<Value>()
            .await
            .map_err(|e| TabulaError::UpstreamFailure {
                status: 502,
                detail: format!("unparseable webhook reply: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, api_key: Option<&str>) -> UpstreamConfig {
        UpstreamConfig {
            webhook_url: url.to_string(),
            api_key: api_key.map(str::to_string),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn forwards_payload_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            UpstreamClient::new(&config(&format!("{}/webhook", server.uri()), Some("secret")))
                .unwrap();
        let reply = client.send_chat(&json!({"message": "hi"})).await.unwrap();
        assert_eq!(reply["text"], "ok");
    }

    #[tokio::test]
    async fn non_success_status_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine exploded"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config(&server.uri(), None)).unwrap();
        let err = client.send_chat(&json!({})).await.unwrap_err();
        match err {
            TabulaError::UpstreamFailure { status, detail } => {
                assert_eq!(status, 500);
                assert_eq!(detail, "engine exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_url_fails_without_a_network_call() {
        let client = UpstreamClient::new(&config("  ", None)).unwrap();
        assert!(!client.is_configured());
        let err = client.send_chat(&json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            TabulaError::UpstreamFailure { status: 502, .. }
        ));
    }

    #[test]
    fn host_display_hides_the_path() {
        let client =
            UpstreamClient::new(&config("https://engine.example.com/hook/abc123", None)).unwrap();
        assert_eq!(client.host_display(), "engine.example.com");
    }
}
