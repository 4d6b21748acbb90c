//! Client for the database of record. Every call retries transient failures
//! with bounded backoff and then gives up quietly: losing a sync must never
//! abort the in-memory progress of a prompt.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::warn;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenContext {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpsert {
    pub session_id: String,
    pub status: String,
    pub is_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpsert {
    pub session_id: String,
    pub message_id: String,
    pub role: String,
    pub parts: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct DbClient {
    http: Client,
    base_url: String,
    bearer: Option<String>,
}

impl DbClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn validate_token(&self, token: &str) -> Option<TokenContext> {
        let body = json!({ "token": token });
        let value = self.post_retry("/api/validate-token", &body).await?;
        serde_json::from_value(value).ok()
    }

    /// Idempotent, last-writer-wins by session id. Fire-and-forget.
    pub async fn upsert_status(&self, upsert: &StatusUpsert) {
        let body = serde_json::to_value(upsert).unwrap_or(Value::Null);
        if self.post_retry("/api/session-status", &body).await.is_none() {
            warn!(session_id = %upsert.session_id, "session status sync dropped");
        }
    }

    /// Unique by (session, message); later calls overwrite parts/timestamp.
    pub async fn upsert_message(&self, upsert: &MessageUpsert) {
        let body = serde_json::to_value(upsert).unwrap_or(Value::Null);
        if self.post_retry("/api/sync-message", &body).await.is_none() {
            warn!(
                session_id = %upsert.session_id,
                message_id = %upsert.message_id,
                "message sync dropped"
            );
        }
    }

    pub async fn fetch_git_credential(&self) -> Option<String> {
        let value = self.post_retry("/api/github-token", &json!({})).await?;
        value
            .get("accessToken")
            .and_then(Value::as_str)
            .map(|token| token.to_string())
    }

    pub async fn fetch_provider_api_key(&self, provider: &str) -> Option<String> {
        let body = json!({ "provider": provider });
        let value = self.post_retry("/api/user-secret", &body).await?;
        value
            .get("apiKey")
            .and_then(Value::as_str)
            .map(|key| key.to_string())
    }

    /// Up to three attempts with 1 s / 2 s / 4 s delays, retrying only
    /// network errors and 5xx. Returns `None` after exhaustion.
    async fn post_retry(&self, path: &str, body: &Value) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 0..RETRY_ATTEMPTS {
            match self.post_once(&url, body).await {
                Ok(value) => return Some(value),
                Err(RequestFailure::Fatal(status)) => {
                    warn!(url, status, "db request rejected");
                    return None;
                }
                Err(RequestFailure::Retryable(message)) => {
                    if attempt + 1 == RETRY_ATTEMPTS {
                        warn!(url, error = %message, "db request failed after retries");
                        return None;
                    }
                    sleep(RETRY_DELAYS[attempt as usize]).await;
                }
            }
        }
        None
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value, RequestFailure> {
        let mut request = self.http.post(url).json(body).timeout(REQUEST_TIMEOUT);
        if let Some(bearer) = self.bearer.as_deref() {
            request = request.bearer_auth(bearer);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RequestFailure::Retryable(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(RequestFailure::Retryable(format!("db returned {status}")));
        }
        if !status.is_success() {
            return Err(RequestFailure::Fatal(status.as_u16()));
        }
        let text = response
            .text()
            .await
            .map_err(|err| RequestFailure::Retryable(err.to_string()))?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| RequestFailure::Retryable(err.to_string()))
    }
}

enum RequestFailure {
    Retryable(String),
    Fatal(u16),
}
