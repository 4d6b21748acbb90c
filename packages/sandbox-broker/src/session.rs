//! Session data model. A `SessionState` is the root entity: it is persisted
//! on every meaningful transition and only ever mutated by the session actor
//! that owns it.

use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub state: ToolCallState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Tool { call: ToolCall },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub timestamp: i64,
}

impl Message {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: fresh_id(),
            role,
            parts: vec![MessagePart::Text { text: text.into() }],
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub repo: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: SessionStatus,
    pub is_processing: bool,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionState {
    pub fn new(session_id: String, repo: String, user_id: String) -> Self {
        let now = now_ms();
        Self {
            session_id,
            repo,
            user_id,
            selected_model: None,
            provider: None,
            sandbox_id: None,
            sandbox_url: None,
            snapshot_id: None,
            agent_session_id: None,
            branch: None,
            status: SessionStatus::Idle,
            is_processing: false,
            messages: Vec::new(),
            streaming_message: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a message, skipping duplicates: message ids are unique and
    /// insertion order is never rewritten.
    pub fn append_message(&mut self, message: Message) {
        if self.messages.iter().any(|existing| existing.id == message.id) {
            return;
        }
        self.messages.push(message);
    }

    pub fn touch(&mut self) {
        let now = now_ms();
        // updatedAt stays monotonic even if the wall clock steps backwards.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + 1
        };
    }

    pub fn clear_sandbox_refs(&mut self) {
        self.sandbox_id = None;
        self.sandbox_url = None;
        self.agent_session_id = None;
    }

    pub fn view(&self) -> SessionStateView {
        let mut messages = self.messages.clone();
        if let Some(streaming) = self.streaming_message.clone() {
            messages.push(streaming);
        }
        SessionStateView {
            session_id: self.session_id.clone(),
            repo: self.repo.clone(),
            user_id: self.user_id.clone(),
            selected_model: self.selected_model.clone(),
            provider: self.provider.clone(),
            sandbox_id: self.sandbox_id.clone(),
            snapshot_id: self.snapshot_id.clone(),
            branch: self.branch.clone(),
            status: self.status,
            is_processing: self.is_processing,
            messages,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Client-facing snapshot: the in-progress assistant message, when present,
/// is folded into `messages` and never exposed as a separate field.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateView {
    pub session_id: String,
    pub repo: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: SessionStatus,
    pub is_processing: bool,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
