#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::sleep;

use sandbox_broker::actor::{InitializeCommand, SessionActor};
use sandbox_broker::session::{SessionState, SessionStatus};
use sandbox_broker::store::StateStore;
use sandbox_broker_sandbox_client::ProviderClient;

pub const MOCK_EVENT_DELAY_MS: u64 = 20;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Mock agent server: speaks the /global/health, /session,
// /session/:id/message, and /event contract.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockAgentState {
    healthy: AtomicBool,
    session_counter: AtomicU64,
    /// One scripted event list per /event subscription, popped in order.
    event_scripts: Mutex<VecDeque<Vec<Value>>>,
    /// Response body for GET /session/:id/message; `None` replies 500.
    messages: Mutex<Option<Value>>,
    pub prompts: Mutex<Vec<Value>>,
    pub sessions_created: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct MockAgent {
    pub base_url: String,
    pub sessions_created: Arc<AtomicU64>,
    state: Arc<MockAgentState>,
}

impl MockAgent {
    pub async fn start() -> Self {
        let state = Arc::new(MockAgentState {
            healthy: AtomicBool::new(true),
            ..MockAgentState::default()
        });
        let router = Router::new()
            .route("/global/health", get(agent_health))
            .route("/session", post(agent_create_session))
            .route(
                "/session/:session_id/message",
                get(agent_get_messages).post(agent_post_message),
            )
            .route("/event", get(agent_events))
            .with_state(state.clone());
        let base_url = serve(router).await;
        let sessions_created = state.sessions_created.clone();
        Self {
            base_url,
            sessions_created,
            state,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub async fn push_event_script(&self, events: Vec<Value>) {
        self.state.event_scripts.lock().await.push_back(events);
    }

    pub async fn set_messages(&self, messages: Option<Value>) {
        *self.state.messages.lock().await = messages;
    }

    pub async fn prompt_count(&self) -> usize {
        self.state.prompts.lock().await.len()
    }
}

async fn agent_health(State(state): State<Arc<MockAgentState>>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({ "healthy": true }))).into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn agent_create_session(State(state): State<Arc<MockAgentState>>) -> Json<Value> {
    state.sessions_created.fetch_add(1, Ordering::SeqCst);
    let id = state.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "id": format!("a{id}") }))
}

async fn agent_post_message(
    State(state): State<Arc<MockAgentState>>,
    Path(_session_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.prompts.lock().await.push(body);
    Json(json!({}))
}

async fn agent_get_messages(
    State(state): State<Arc<MockAgentState>>,
    Path(_session_id): Path<String>,
) -> Response {
    match state.messages.lock().await.clone() {
        Some(messages) => (StatusCode::OK, Json(messages)).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn agent_events(
    State(state): State<Arc<MockAgentState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let script = state
        .event_scripts
        .lock()
        .await
        .pop_front()
        .unwrap_or_default();
    let stream = stream::unfold(script.into_iter(), |mut events| async move {
        match events.next() {
            Some(event) => {
                sleep(Duration::from_millis(MOCK_EVENT_DELAY_MS)).await;
                let sse = Event::default()
                    .json_data(event)
                    .unwrap_or_else(|_| Event::default().data("{}"));
                Some((Ok::<Event, Infallible>(sse), events))
            }
            None => {
                // Keep the subscription open; the broker cancels it.
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    });
    Sse::new(stream)
}

// ---------------------------------------------------------------------------
// Mock sandbox provider.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockProviderState {
    sandbox_counter: AtomicU64,
    snapshot_counter: AtomicU64,
    /// Tunnel URL handed out by create.
    create_tunnel: Mutex<Option<String>>,
    /// Tunnel URL handed out by resume.
    resume_tunnel: Mutex<Option<String>>,
    /// When set, pause answers 409.
    pause_conflict: AtomicBool,
    pub terminated: Mutex<Vec<String>>,
    pub snapshots_taken: AtomicU64,
}

#[derive(Clone)]
pub struct MockProvider {
    pub base_url: String,
    state: Arc<MockProviderState>,
}

impl MockProvider {
    pub async fn start() -> Self {
        let state = Arc::new(MockProviderState::default());
        let router = Router::new()
            .route("/api_create_sandbox", post(provider_create))
            .route("/api_snapshot_sandbox", post(provider_snapshot))
            .route("/api_pause_sandbox", post(provider_pause))
            .route("/api_resume_sandbox", post(provider_resume))
            .route("/api_terminate_sandbox", post(provider_terminate))
            .with_state(state.clone());
        let base_url = serve(router).await;
        Self { base_url, state }
    }

    pub async fn set_create_tunnel(&self, url: &str) {
        *self.state.create_tunnel.lock().await = Some(url.to_string());
    }

    pub async fn set_resume_tunnel(&self, url: &str) {
        *self.state.resume_tunnel.lock().await = Some(url.to_string());
    }

    pub fn set_pause_conflict(&self, conflict: bool) {
        self.state.pause_conflict.store(conflict, Ordering::SeqCst);
    }

    pub async fn terminated(&self) -> Vec<String> {
        self.state.terminated.lock().await.clone()
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.state.snapshots_taken.load(Ordering::SeqCst)
    }

    pub fn client(&self, http: reqwest::Client) -> ProviderClient {
        ProviderClient::new(http, self.base_url.clone(), None)
    }
}

async fn provider_create(State(state): State<Arc<MockProviderState>>) -> Response {
    let Some(tunnel) = state.create_tunnel.lock().await.clone() else {
        return (
            StatusCode::OK,
            Json(json!({ "error": "no sandbox capacity configured" })),
        )
            .into_response();
    };
    let id = state.sandbox_counter.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({
            "sandbox_id": format!("sb{id}"),
            "tunnel_url": tunnel,
            "branch_name": format!("opencode/session-{id}"),
        })),
    )
        .into_response()
}

async fn provider_snapshot(State(state): State<Arc<MockProviderState>>) -> Json<Value> {
    state.snapshots_taken.fetch_add(1, Ordering::SeqCst);
    let id = state.snapshot_counter.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "snapshot_id": format!("snap{id}") }))
}

async fn provider_pause(State(state): State<Arc<MockProviderState>>) -> Response {
    if state.pause_conflict.load(Ordering::SeqCst) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "sandbox already terminated" })),
        )
            .into_response();
    }
    let id = state.snapshot_counter.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({ "snapshot_id": format!("snap{id}") })),
    )
        .into_response()
}

async fn provider_resume(State(state): State<Arc<MockProviderState>>) -> Response {
    let Some(tunnel) = state.resume_tunnel.lock().await.clone() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "resume target missing" })),
        )
            .into_response();
    };
    let id = state.sandbox_counter.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({
            "sandbox_id": format!("sb{id}"),
            "tunnel_url": tunnel,
        })),
    )
        .into_response()
}

async fn provider_terminate(
    State(state): State<Arc<MockProviderState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    if let Some(id) = body.get("sandbox_id").and_then(Value::as_str) {
        state.terminated.lock().await.push(id.to_string());
    }
    Json(json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Mock database of record.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDbState {
    /// token -> (userId, sessionId)
    tokens: Mutex<HashMap<String, (String, String)>>,
    pub status_upserts: Mutex<Vec<Value>>,
    pub message_upserts: Mutex<Vec<Value>>,
}

#[derive(Clone)]
pub struct MockDb {
    pub base_url: String,
    state: Arc<MockDbState>,
}

impl MockDb {
    pub async fn start() -> Self {
        let state = Arc::new(MockDbState::default());
        let router = Router::new()
            .route("/api/validate-token", post(db_validate_token))
            .route("/api/github-token", post(db_github_token))
            .route("/api/user-secret", post(db_user_secret))
            .route("/api/session-status", post(db_session_status))
            .route("/api/sync-message", post(db_sync_message))
            .with_state(state.clone());
        let base_url = serve(router).await;
        Self { base_url, state }
    }

    pub async fn grant(&self, token: &str, user_id: &str, session_id: &str) {
        self.state.tokens.lock().await.insert(
            token.to_string(),
            (user_id.to_string(), session_id.to_string()),
        );
    }

    pub async fn status_upserts(&self) -> Vec<Value> {
        self.state.status_upserts.lock().await.clone()
    }

    pub async fn message_upserts(&self) -> Vec<Value> {
        self.state.message_upserts.lock().await.clone()
    }
}

async fn db_validate_token(
    State(state): State<Arc<MockDbState>>,
    Json(body): Json<Value>,
) -> Response {
    let token = body.get("token").and_then(Value::as_str).unwrap_or("");
    match state.tokens.lock().await.get(token) {
        Some((user_id, session_id)) => (
            StatusCode::OK,
            Json(json!({ "userId": user_id, "sessionId": session_id })),
        )
            .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn db_github_token() -> Json<Value> {
    Json(json!({ "accessToken": "ghp_test_pat" }))
}

async fn db_user_secret() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn db_session_status(
    State(state): State<Arc<MockDbState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.status_upserts.lock().await.push(body);
    Json(json!({}))
}

async fn db_sync_message(
    State(state): State<Arc<MockDbState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.message_upserts.lock().await.push(body);
    Json(json!({}))
}

// ---------------------------------------------------------------------------
// Actor-level harness.
// ---------------------------------------------------------------------------

pub struct ActorHarness {
    pub actor: SessionActor,
    pub agent: MockAgent,
    pub provider: MockProvider,
    pub db: MockDb,
    pub store: StateStore,
    _state_dir: TempDir,
}

impl ActorHarness {
    pub async fn new(session_id: &str) -> Self {
        let agent = MockAgent::start().await;
        let provider = MockProvider::start().await;
        provider.set_create_tunnel(&agent.base_url).await;
        provider.set_resume_tunnel(&agent.base_url).await;
        let db = MockDb::start().await;

        let state_dir = tempfile::tempdir().expect("temp state dir");
        let store = StateStore::open(&state_dir.path().join("state.db"))
            .await
            .expect("open state store");
        let http = reqwest::Client::new();
        let actor = SessionActor::load(
            session_id.to_string(),
            store.clone(),
            provider.client(http.clone()),
            http,
        )
        .await;

        Self {
            actor,
            agent,
            provider,
            db,
            store,
            _state_dir: state_dir,
        }
    }

    pub async fn initialize(&self, session_id: &str, repo: &str, user_id: &str) {
        self.actor
            .initialize(InitializeCommand {
                session_id: session_id.to_string(),
                repo: repo.to_string(),
                user_id: user_id.to_string(),
                bearer: format!("tok-{session_id}"),
                db_site_url: self.db.base_url.clone(),
                selected_model: None,
                provider: None,
            })
            .await
            .expect("initialize");
    }

    pub async fn wait_for_status(&self, expected: SessionStatus, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let view = self.actor.view().await.expect("view");
            if view.status == expected {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("status never reached {expected:?}; last was {:?}", view.status);
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn stored_state(&self, session_id: &str) -> SessionState {
        self.store
            .load_session(session_id)
            .await
            .expect("persisted session state")
    }
}

/// Checks the durable-state invariants that must hold after every command.
pub fn assert_invariants(state: &SessionState) {
    if state.status == SessionStatus::Running {
        assert!(state.sandbox_id.is_some(), "running without sandboxId");
        assert!(state.sandbox_url.is_some(), "running without sandboxUrl");
        assert!(
            state.agent_session_id.is_some(),
            "running without agentSessionId"
        );
    }
    if state.status == SessionStatus::Paused {
        assert!(state.snapshot_id.is_some(), "paused without snapshotId");
        assert!(state.sandbox_id.is_none(), "paused with sandboxId");
        assert!(state.sandbox_url.is_none(), "paused with sandboxUrl");
    }
    if state.is_processing {
        assert_eq!(
            state.status,
            SessionStatus::Running,
            "processing outside running"
        );
    }
    let mut seen = std::collections::HashSet::new();
    for message in &state.messages {
        assert!(seen.insert(message.id.clone()), "duplicate message id");
    }
    assert!(state.updated_at >= state.created_at, "updatedAt regressed");
}

// Common event payloads.

pub fn ev_connected() -> Value {
    json!({ "type": "server.connected", "properties": {} })
}

pub fn ev_idle(session_id: &str) -> Value {
    json!({ "type": "session.idle", "properties": { "sessionID": session_id } })
}

pub fn ev_text(text: &str, message_id: &str) -> Value {
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": { "type": "text", "text": text, "messageID": message_id }
        }
    })
}

pub fn ev_tool(id: &str, tool: &str, input: Value, output: Option<&str>, status: &str) -> Value {
    let mut state = json!({ "status": status, "input": input });
    if let Some(output) = output {
        state["output"] = json!(output);
    }
    json!({
        "type": "message.part.updated",
        "properties": {
            "part": { "type": "tool-call", "id": id, "tool": tool, "state": state }
        }
    })
}

/// The agent server's authoritative message list for a finished turn.
pub fn agent_messages(prompt: &str, reply_parts: Vec<Value>) -> Value {
    json!([
        {
            "info": { "role": "user" },
            "parts": [{ "type": "text", "text": prompt }]
        },
        {
            "info": { "role": "assistant" },
            "parts": reply_parts
        }
    ])
}
