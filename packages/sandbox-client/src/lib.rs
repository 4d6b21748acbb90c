//! Typed clients for the sandbox provider API and the agent server that runs
//! inside a sandbox.

use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sandbox_broker_error::{UpstreamError, UpstreamKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(120);
pub const PAUSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SNAPSHOT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(10);
pub const SNAPSHOT_EXPLICIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(180);
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const HEALTH_ATTEMPTS: usize = 30;
const HEALTH_DELAY: Duration = Duration::from_secs(2);
const SESSION_CREATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub repo: String,
    pub git_credential: String,
    pub provider_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResponse {
    #[serde(alias = "sandboxId")]
    pub sandbox_id: String,
    #[serde(alias = "tunnelUrl")]
    pub tunnel_url: String,
    #[serde(default, alias = "branchName")]
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    #[serde(alias = "snapshotId")]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeSandboxResponse {
    #[serde(alias = "sandboxId")]
    pub sandbox_id: String,
    #[serde(alias = "tunnelUrl")]
    pub tunnel_url: String,
}

/// Model selection forwarded to the agent server, in its wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// One message from the agent server's authoritative message list. The
/// server nests the role under `info`; older builds inline it.
#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub role: Option<String>,
    pub parts: Vec<Value>,
}

impl AgentMessage {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let role = obj
            .get("info")
            .and_then(|info| info.get("role"))
            .or_else(|| obj.get("role"))
            .and_then(Value::as_str)
            .map(|role| role.to_string());
        let parts = obj
            .get("parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Some(Self { role, parts })
    }
}

/// Client for the sandbox provider's HTTP facade.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: String,
    api_secret: Option<String>,
}

impl ProviderClient {
    pub fn new(http: Client, base_url: String, api_secret: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret,
        }
    }

    pub async fn create_sandbox(
        &self,
        request: &CreateSandboxRequest,
    ) -> Result<CreateSandboxResponse, UpstreamError> {
        let body = json!({
            "repo": request.repo,
            "pat": request.git_credential,
            "provider_api_key": request.provider_api_key,
        });
        self.post("api_create_sandbox", &body, CREATE_TIMEOUT).await
    }

    pub async fn snapshot_sandbox(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> Result<SnapshotResponse, UpstreamError> {
        let body = json!({ "sandbox_id": sandbox_id });
        self.post("api_snapshot_sandbox", &body, timeout).await
    }

    pub async fn pause_sandbox(&self, sandbox_id: &str) -> Result<SnapshotResponse, UpstreamError> {
        let body = json!({ "sandbox_id": sandbox_id });
        self.post("api_pause_sandbox", &body, PAUSE_TIMEOUT).await
    }

    pub async fn resume_sandbox(
        &self,
        snapshot_id: &str,
    ) -> Result<ResumeSandboxResponse, UpstreamError> {
        let body = json!({ "snapshot_id": snapshot_id });
        self.post("api_resume_sandbox", &body, RESUME_TIMEOUT).await
    }

    /// Best-effort: failures are logged and swallowed.
    pub async fn terminate_sandbox(&self, sandbox_id: &str) {
        let body = json!({ "sandbox_id": sandbox_id });
        if let Err(err) = self
            .post::<Value>("api_terminate_sandbox", &body, TERMINATE_TIMEOUT)
            .await
        {
            warn!(sandbox_id, error = %err, "terminate sandbox failed");
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut request = self.http.post(&url).json(body).timeout(timeout);
        if let Some(secret) = self.api_secret.as_deref() {
            request = request.bearer_auth(secret);
        }
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            UpstreamError::new(UpstreamKind::BadRequest, format!("invalid response: {err}"))
        })?;
        // The provider reports some failures as 200 with an error body.
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(UpstreamError::new(
                UpstreamKind::BadRequest,
                message.to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|err| {
            UpstreamError::new(UpstreamKind::BadRequest, format!("invalid response: {err}"))
        })
    }
}

/// Client for the agent server reachable at a sandbox's tunnel URL.
#[derive(Debug, Clone)]
pub struct AgentServerClient {
    http: Client,
}

impl AgentServerClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Polls `/global/health` until the server answers OK.
    pub async fn wait_healthy(&self, base_url: &str) -> Result<(), UpstreamError> {
        for attempt in 0..HEALTH_ATTEMPTS {
            if self.probe_health(base_url).await {
                debug!(base_url, attempt, "agent server healthy");
                return Ok(());
            }
            sleep(HEALTH_DELAY).await;
        }
        Err(UpstreamError::new(
            UpstreamKind::NetworkTimeout,
            format!("agent server failed health check after {HEALTH_ATTEMPTS} attempts"),
        ))
    }

    /// Single health probe with a short timeout; used for reachability checks.
    pub async fn probe_health(&self, base_url: &str) -> bool {
        let url = format!("{}/global/health", base_url.trim_end_matches('/'));
        match self
            .http
            .get(&url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn create_agent_session(&self, base_url: &str) -> Result<String, UpstreamError> {
        let url = format!("{}/session", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({}))
            .timeout(SESSION_CREATE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            UpstreamError::new(UpstreamKind::BadRequest, format!("invalid response: {err}"))
        })?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.to_string())
            .ok_or_else(|| UpstreamError::new(UpstreamKind::BadRequest, "session missing id"))
    }

    pub async fn send_prompt(
        &self,
        base_url: &str,
        agent_session_id: &str,
        text: &str,
        model: Option<&ModelRef>,
    ) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/session/{}/message",
            base_url.trim_end_matches('/'),
            agent_session_id
        );
        let mut body = json!({
            "agent": "build",
            "parts": [{ "type": "text", "text": text }],
        });
        if let Some(model) = model {
            body["model"] = serde_json::to_value(model).unwrap_or(Value::Null);
        }
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(PROMPT_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &text));
        }
        Ok(())
    }

    /// Fetches the authoritative message list. Accepts either a bare array
    /// or an object with a `messages` field; anything else is rejected.
    pub async fn fetch_messages(
        &self,
        base_url: &str,
        agent_session_id: &str,
        timeout: Duration,
    ) -> Result<Vec<AgentMessage>, UpstreamError> {
        let url = format!(
            "{}/session/{}/message",
            base_url.trim_end_matches('/'),
            agent_session_id
        );
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            UpstreamError::new(UpstreamKind::BadRequest, format!("invalid response: {err}"))
        })?;
        let items = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("messages")
                .and_then(Value::as_array)
                .map(|items| items.as_slice())
                .ok_or_else(|| {
                    UpstreamError::new(UpstreamKind::BadRequest, "unrecognized message list shape")
                })?,
            _ => {
                return Err(UpstreamError::new(
                    UpstreamKind::BadRequest,
                    "unrecognized message list shape",
                ))
            }
        };
        Ok(items.iter().filter_map(AgentMessage::from_value).collect())
    }

    /// Streams `/event` SSE payloads into `tx` until the stream ends or the
    /// receiver is dropped. The pump never touches session state; callers
    /// cancel it by dropping the receiver or aborting the task.
    pub async fn subscribe_events(&self, base_url: &str, tx: mpsc::UnboundedSender<Value>) {
        let url = format!("{}/event", base_url.trim_end_matches('/'));
        let response = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(url, status = %response.status(), "event subscription rejected");
                return;
            }
            Err(err) => {
                warn!(url, error = %err, "event subscription failed");
                return;
            }
        };

        let mut accumulator = SseAccumulator::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(url, error = %err, "event stream ended with error");
                    return;
                }
            };
            let text = String::from_utf8_lossy(&chunk);
            for payload in accumulator.push(&text) {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "discarding unparsable event payload");
                    }
                }
            }
        }
    }
}

/// Reassembles SSE `data:` payloads from arbitrarily chunked network reads.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim_start().to_string());
            }
        }
        payloads
    }
}

fn map_transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::new(UpstreamKind::NetworkTimeout, err.to_string())
    } else if let Some(status) = err.status() {
        map_status(status, &err.to_string())
    } else {
        // Connection refused, DNS failure, reset: retryable like a timeout.
        UpstreamError::new(UpstreamKind::NetworkTimeout, err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = if body.is_empty() {
        format!("upstream returned {status}")
    } else {
        format!("upstream returned {status}: {body}")
    };
    let kind = match status {
        StatusCode::NOT_FOUND => UpstreamKind::NotFound,
        StatusCode::CONFLICT => UpstreamKind::Conflict,
        StatusCode::BAD_REQUEST => UpstreamKind::BadRequest,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamKind::Unauthorized,
        status if status.is_server_error() => UpstreamKind::Transient5xx,
        _ => UpstreamKind::BadRequest,
    };
    UpstreamError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_handles_split_chunks() {
        let mut acc = SseAccumulator::new();
        assert!(acc.push("data: {\"a\"").is_empty());
        let payloads = acc.push(":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn accumulator_joins_multiline_data() {
        let mut acc = SseAccumulator::new();
        let payloads = acc.push("data: one\ndata: two\n\n");
        assert_eq!(payloads, vec!["one\ntwo"]);
    }

    #[test]
    fn accumulator_ignores_comments_and_ids() {
        let mut acc = SseAccumulator::new();
        let payloads = acc.push(": keepalive\nid: 7\ndata: {\"x\":true}\n\n");
        assert_eq!(payloads, vec!["{\"x\":true}"]);
    }

    #[test]
    fn agent_message_reads_nested_and_flat_roles() {
        let nested = serde_json::json!({
            "info": { "role": "assistant" },
            "parts": [{ "type": "text", "text": "hi" }],
        });
        let flat = serde_json::json!({ "role": "user", "parts": [] });
        assert_eq!(
            AgentMessage::from_value(&nested).unwrap().role.as_deref(),
            Some("assistant")
        );
        assert_eq!(
            AgentMessage::from_value(&flat).unwrap().role.as_deref(),
            Some("user")
        );
    }

    #[test]
    fn status_mapping_covers_conflict_and_5xx() {
        assert_eq!(
            map_status(StatusCode::CONFLICT, "").kind,
            UpstreamKind::Conflict
        );
        assert_eq!(
            map_status(StatusCode::BAD_GATEWAY, "").kind,
            UpstreamKind::Transient5xx
        );
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, "").kind,
            UpstreamKind::NotFound
        );
    }
}
