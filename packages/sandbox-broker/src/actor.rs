//! Per-session actor: the single writer for a `SessionState`.
//!
//! Lifecycle commands (initialize / pause / resume / stop) serialize on one
//! lock; `prompt` is admitted through an atomic check-and-set of
//! `is_processing` so a second prompt observes `Busy` instead of queueing.
//! Background tasks (sandbox creation, attach probes) carry an epoch and
//! re-check it before writing, so a stale task can never clobber state that
//! moved on without it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sandbox_broker_db_client::{DbClient, MessageUpsert, StatusUpsert};
use sandbox_broker_error::{BrokerError, UpstreamKind};
use sandbox_broker_sandbox_client::{
    AgentServerClient, CreateSandboxRequest, ModelRef, ProviderClient,
    SNAPSHOT_BACKGROUND_TIMEOUT,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, Frame, StreamingPayload};
use crate::normalizer::{
    normalize_fetched_parts, text_length, tool_part_count, EventNormalizer, Observation,
};
use crate::session::{
    fresh_id, now_ms, Message, MessagePart, MessageRole, SessionState, SessionStateView,
    SessionStatus,
};
use crate::store::StateStore;

const CONNECTED_WAIT: Duration = Duration::from_secs(3);
const IDLE_WAIT: Duration = Duration::from_secs(300);
const IDLE_WAIT_ENV: &str = "BROKER_IDLE_WAIT_MS";
const SSE_GRACE: Duration = Duration::from_millis(200);
const STREAM_CHECKPOINT_EVERY: Duration = Duration::from_secs(2);
const RECOVERY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const TIMEOUT_NOTE: &str = "⚠️ Response timed out. Partial content shown above. \
The AI may still be processing — try refreshing in a moment.";

fn idle_wait() -> Duration {
    std::env::var(IDLE_WAIT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(IDLE_WAIT)
}

#[derive(Debug, Clone)]
pub struct InitializeCommand {
    pub session_id: String,
    pub repo: String,
    pub user_id: String,
    pub bearer: String,
    pub db_site_url: String,
    pub selected_model: Option<String>,
    pub provider: Option<String>,
}

#[derive(Clone)]
pub struct SessionActor {
    inner: Arc<ActorInner>,
}

struct ActorInner {
    session_id: String,
    store: StateStore,
    provider: ProviderClient,
    agent: AgentServerClient,
    http: Client,
    state: Mutex<Option<SessionState>>,
    lifecycle: Mutex<()>,
    broadcaster: Broadcaster,
    db: Mutex<Option<DbClient>>,
    sse_task: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
}

impl SessionActor {
    /// Hydrates the actor from durable storage before any command runs.
    pub async fn load(
        session_id: String,
        store: StateStore,
        provider: ProviderClient,
        http: Client,
    ) -> Self {
        let state = store.load_session(&session_id).await;
        let db = match store.load_auth(&session_id).await {
            Some((db_site_url, bearer)) => {
                Some(DbClient::new(http.clone(), db_site_url).with_bearer(bearer))
            }
            None => None,
        };
        if state.is_some() {
            info!(session_id, "session hydrated from durable storage");
        }
        Self {
            inner: Arc::new(ActorInner {
                session_id,
                store,
                provider,
                agent: AgentServerClient::new(http.clone()),
                http,
                state: Mutex::new(state),
                lifecycle: Mutex::new(()),
                broadcaster: Broadcaster::new(),
                db: Mutex::new(db),
                sse_task: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub async fn initialize(
        &self,
        command: InitializeCommand,
    ) -> Result<SessionStateView, BrokerError> {
        let _guard = self.inner.lifecycle.lock().await;

        self.inner
            .store
            .save_auth(&command.session_id, &command.db_site_url, &command.bearer)
            .await;
        let db = DbClient::new(self.inner.http.clone(), command.db_site_url.clone())
            .with_bearer(command.bearer.clone());
        *self.inner.db.lock().await = Some(db);

        {
            let mut state = self.inner.state.lock().await;
            match state.as_ref() {
                Some(existing) if existing.repo != command.repo => {
                    return Err(BrokerError::bad_request(format!(
                        "session already bound to repo {}",
                        existing.repo
                    )));
                }
                Some(existing) if existing.status != SessionStatus::Idle => {
                    // Compatible re-init of a live session is a no-op.
                    return Ok(existing.view());
                }
                _ => {}
            }
            let mut fresh = state.take().unwrap_or_else(|| {
                SessionState::new(
                    command.session_id.clone(),
                    command.repo.clone(),
                    command.user_id.clone(),
                )
            });
            fresh.selected_model = command.selected_model.clone();
            fresh.provider = command.provider.clone();
            *state = Some(fresh);
        }

        self.transition(|state| {
            state.status = SessionStatus::Starting;
            state.error = None;
        })
        .await?;

        let actor = self.clone();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            actor.create_sandbox_background(epoch).await;
        });

        self.view().await
    }

    async fn create_sandbox_background(&self, epoch: u64) {
        let result = self.boot_fresh_sandbox().await;
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            // Stopped while booting: don't leak the sandbox we just made.
            if let Ok(boot) = result {
                self.inner.provider.terminate_sandbox(&boot.sandbox_id).await;
            }
            return;
        }
        match result {
            Ok(boot) => {
                let _ = self
                    .transition(|state| {
                        state.sandbox_id = Some(boot.sandbox_id);
                        state.sandbox_url = Some(boot.tunnel_url);
                        state.agent_session_id = Some(boot.agent_session_id);
                        if boot.branch.is_some() {
                            state.branch = boot.branch;
                        }
                        state.status = SessionStatus::Running;
                        state.error = None;
                    })
                    .await;
            }
            Err(err) => {
                warn!(session_id = %self.inner.session_id, error = %err, "sandbox boot failed");
                let message = err.to_string();
                let _ = self
                    .transition(|state| {
                        state.status = SessionStatus::Error;
                        state.error = Some(message);
                    })
                    .await;
            }
        }
    }

    async fn boot_fresh_sandbox(&self) -> Result<BootedSandbox, BrokerError> {
        let db = self
            .db()
            .await
            .ok_or_else(|| BrokerError::sandbox_error("session has no database binding"))?;
        let git_credential = db
            .fetch_git_credential()
            .await
            .ok_or_else(|| BrokerError::sandbox_error("failed to fetch git credential"))?;
        let provider_name = {
            let state = self.inner.state.lock().await;
            state.as_ref().and_then(|state| state.provider.clone())
        };
        let provider_api_key = match provider_name.as_deref() {
            Some(provider) => db.fetch_provider_api_key(provider).await,
            None => None,
        };
        let repo = {
            let state = self.inner.state.lock().await;
            state
                .as_ref()
                .map(|state| state.repo.clone())
                .ok_or_else(|| BrokerError::bad_request("session not initialized"))?
        };

        let created = self
            .inner
            .provider
            .create_sandbox(&CreateSandboxRequest {
                repo,
                git_credential,
                provider_api_key,
            })
            .await
            .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
        self.inner
            .agent
            .wait_healthy(&created.tunnel_url)
            .await
            .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
        let agent_session_id = self
            .inner
            .agent
            .create_agent_session(&created.tunnel_url)
            .await
            .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
        Ok(BootedSandbox {
            sandbox_id: created.sandbox_id,
            tunnel_url: created.tunnel_url,
            branch: created.branch_name,
            agent_session_id,
        })
    }

    pub async fn view(&self) -> Result<SessionStateView, BrokerError> {
        let state = self.inner.state.lock().await;
        state
            .as_ref()
            .map(|state| state.view())
            .ok_or_else(|| BrokerError::bad_request("session not initialized"))
    }

    /// Registers an observer: returns the immediate `state` snapshot and the
    /// live frame stream, then schedules the attach-time health probe.
    pub async fn attach(&self) -> Result<(SessionStateView, broadcast::Receiver<Frame>), BrokerError> {
        let view = self.view().await?;
        let receiver = self.inner.broadcaster.subscribe();

        let should_probe = {
            let state = self.inner.state.lock().await;
            state
                .as_ref()
                .map(|state| {
                    state.status == SessionStatus::Running && state.sandbox_url.is_some()
                })
                .unwrap_or(false)
        };
        if should_probe {
            let actor = self.clone();
            let epoch = self.inner.epoch.load(Ordering::SeqCst);
            tokio::spawn(async move {
                actor.attach_probe(epoch).await;
            });
        }

        Ok((view, receiver))
    }

    async fn attach_probe(&self, epoch: u64) {
        let url = {
            let state = self.inner.state.lock().await;
            match state.as_ref() {
                Some(state)
                    if state.status == SessionStatus::Running && !state.is_processing =>
                {
                    state.sandbox_url.clone()
                }
                _ => None,
            }
        };
        let Some(url) = url else { return };
        if self.inner.agent.probe_health(&url).await {
            return;
        }
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        warn!(session_id = %self.inner.session_id, "attach probe found sandbox unreachable");
        let _ = self.mark_sandbox_dead().await;
    }

    /// Sandbox is gone: fall back to the snapshot when one exists.
    async fn mark_sandbox_dead(&self) -> SessionStatus {
        let mut outcome = SessionStatus::Idle;
        let _ = self
            .transition(|state| {
                if state.status != SessionStatus::Running {
                    outcome = state.status;
                    return;
                }
                state.clear_sandbox_refs();
                if state.snapshot_id.is_some() {
                    state.status = SessionStatus::Paused;
                } else {
                    state.status = SessionStatus::Idle;
                    state.error = Some("sandbox became unreachable".to_string());
                }
                outcome = state.status;
            })
            .await;
        outcome
    }

    pub async fn prompt(&self, text: String) -> Result<(), BrokerError> {
        let user_message = Message {
            id: fresh_id(),
            role: MessageRole::User,
            parts: vec![MessagePart::Text { text: text.clone() }],
            timestamp: now_ms(),
        };

        // Admission gate: reject before mutating anything, then atomically
        // claim the processing slot and append the user message.
        {
            let mut state = self.inner.state.lock().await;
            let state = state
                .as_mut()
                .ok_or_else(|| BrokerError::bad_request("session not initialized"))?;
            if state.is_processing {
                return Err(BrokerError::Busy);
            }
            match state.status {
                SessionStatus::Starting => return Err(BrokerError::NotReady),
                SessionStatus::Running => {}
                _ if state.snapshot_id.is_some() => {}
                _ => return Err(BrokerError::NoSandbox),
            }
            state.streaming_message = None;
            state.append_message(user_message.clone());
            state.is_processing = true;
        }
        self.persist_and_broadcast().await;
        self.sync_message(&user_message).await;

        match self.run_prompt(&text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let mut state = self.inner.state.lock().await;
                    if let Some(state) = state.as_mut() {
                        state.is_processing = false;
                        state.streaming_message = None;
                    }
                }
                self.persist_and_broadcast().await;
                self.sync_status().await;
                Err(err)
            }
        }
    }

    async fn run_prompt(&self, text: &str) -> Result<(), BrokerError> {
        // Reachability: make sure a live sandbox backs this prompt.
        let (status, sandbox_url, snapshot_id) = {
            let state = self.inner.state.lock().await;
            let state = state.as_ref().expect("state checked by admission gate");
            (
                state.status,
                state.sandbox_url.clone(),
                state.snapshot_id.clone(),
            )
        };
        match status {
            SessionStatus::Running => {
                let url = sandbox_url
                    .ok_or_else(|| BrokerError::sandbox_error("running without sandbox url"))?;
                if !self.inner.agent.probe_health(&url).await {
                    let fallback = self.mark_sandbox_dead().await;
                    if fallback == SessionStatus::Paused {
                        self.resume_pipeline().await?;
                    } else {
                        return Err(BrokerError::SandboxLost {
                            message: "sandbox became unreachable".to_string(),
                        });
                    }
                }
            }
            SessionStatus::Paused | SessionStatus::Idle | SessionStatus::Error
                if snapshot_id.is_some() =>
            {
                self.resume_pipeline().await?;
            }
            _ => return Err(BrokerError::NoSandbox),
        }

        let (tunnel_url, agent_session_id, model) = {
            let state = self.inner.state.lock().await;
            let state = state.as_ref().expect("state checked by admission gate");
            let model = match (state.provider.as_ref(), state.selected_model.as_ref()) {
                (Some(provider), Some(model)) => Some(ModelRef {
                    provider_id: provider.clone(),
                    model_id: model.clone(),
                }),
                _ => None,
            };
            (
                state
                    .sandbox_url
                    .clone()
                    .ok_or_else(|| BrokerError::sandbox_error("no sandbox url after resume"))?,
                state
                    .agent_session_id
                    .clone()
                    .ok_or_else(|| BrokerError::sandbox_error("no agent session after resume"))?,
                model,
            )
        };

        let assistant_message_id = fresh_id();
        let mut normalizer = EventNormalizer::new(text);
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let pump = {
            let agent = self.inner.agent.clone();
            let url = tunnel_url.clone();
            tokio::spawn(async move {
                agent.subscribe_events(&url, tx).await;
            })
        };
        *self.inner.sse_task.lock().await = Some(pump);

        // SSE warm-up: wait briefly for server.connected, but never fail the
        // prompt because the stream was slow to open.
        let warmup_deadline = Instant::now() + CONNECTED_WAIT;
        loop {
            let remaining = warmup_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => {
                    let observation = self
                        .handle_stream_event(&mut normalizer, &assistant_message_id, &event)
                        .await;
                    if observation == Observation::Connected {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if let Err(err) = self
            .inner
            .agent
            .send_prompt(&tunnel_url, &agent_session_id, text, model.as_ref())
            .await
        {
            warn!(session_id = %self.inner.session_id, error = %err, "prompt send failed");
            self.cancel_sse().await;
            let may_have_completed = err.is_timeout() || err.kind == UpstreamKind::Transient5xx;
            return self
                .recover_prompt(
                    &assistant_message_id,
                    &normalizer,
                    text,
                    &tunnel_url,
                    &agent_session_id,
                    may_have_completed,
                    err.to_string(),
                )
                .await;
        }

        // Stream until the agent goes idle, the subscription dies, or the
        // idle wait expires.
        let idle_wait = idle_wait();
        let deadline = Instant::now() + idle_wait;
        let mut last_checkpoint = Instant::now();
        let mut completed = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => {
                    let observation = self
                        .handle_stream_event(&mut normalizer, &assistant_message_id, &event)
                        .await;
                    match observation {
                        Observation::Idle => {
                            completed = true;
                            break;
                        }
                        Observation::PartsChanged
                            if last_checkpoint.elapsed() >= STREAM_CHECKPOINT_EVERY =>
                        {
                            last_checkpoint = Instant::now();
                            self.checkpoint_streaming(&assistant_message_id, &normalizer)
                                .await;
                        }
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !completed {
            self.cancel_sse().await;
            return self
                .recover_prompt(
                    &assistant_message_id,
                    &normalizer,
                    text,
                    &tunnel_url,
                    &agent_session_id,
                    true,
                    format!("prompt timed out after {}ms", idle_wait.as_millis()),
                )
                .await;
        }

        // Finalize: drain the tail of the stream, then reconcile against the
        // authoritative message list.
        self.inner.broadcaster.flush().await;
        sleep(SSE_GRACE).await;
        while let Ok(event) = rx.try_recv() {
            self.handle_stream_event(&mut normalizer, &assistant_message_id, &event)
                .await;
        }
        self.cancel_sse().await;

        let streamed = normalizer.ordered_parts();
        let parts = match self
            .inner
            .agent
            .fetch_messages(&tunnel_url, &agent_session_id, RECOVERY_FETCH_TIMEOUT)
            .await
        {
            Ok(messages) => {
                let authoritative = messages
                    .iter()
                    .rev()
                    .find(|message| message.role.as_deref() == Some("assistant"))
                    .map(|message| normalize_fetched_parts(&message.parts, text))
                    .unwrap_or_default();
                debug!(
                    session_id = %self.inner.session_id,
                    streamed_tools = tool_part_count(&streamed),
                    streamed_text = text_length(&streamed),
                    fetched_tools = tool_part_count(&authoritative),
                    fetched_text = text_length(&authoritative),
                    "reconciling streamed parts against fetch"
                );
                if authoritative.is_empty()
                    || (tool_part_count(&authoritative) == 0 && tool_part_count(&streamed) >= 1)
                {
                    streamed
                } else {
                    authoritative
                }
            }
            Err(err) => {
                debug!(session_id = %self.inner.session_id, error = %err, "final fetch failed");
                streamed
            }
        };

        let assistant = Message {
            id: assistant_message_id,
            role: MessageRole::Assistant,
            parts,
            timestamp: now_ms(),
        };
        self.commit_assistant(assistant, None).await;
        self.auto_snapshot().await;
        Ok(())
    }

    async fn handle_stream_event(
        &self,
        normalizer: &mut EventNormalizer,
        assistant_message_id: &str,
        event: &Value,
    ) -> Observation {
        self.inner.broadcaster.event(event.clone());
        let observation = normalizer.observe_value(event);
        match &observation {
            Observation::PartsChanged => {
                self.inner
                    .broadcaster
                    .streaming(StreamingPayload {
                        message_id: assistant_message_id.to_string(),
                        parts: normalizer.ordered_parts(),
                    })
                    .await;
            }
            Observation::Error(message) => {
                debug!(session_id = %self.inner.session_id, message, "agent reported error event");
            }
            _ => {}
        }
        observation
    }

    /// Persists the in-progress assistant message so a restart mid-stream
    /// recovers partial progress. No broadcast.
    async fn checkpoint_streaming(&self, assistant_message_id: &str, normalizer: &EventNormalizer) {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let Some(state) = state.as_mut() else { return };
            state.streaming_message = Some(Message {
                id: assistant_message_id.to_string(),
                role: MessageRole::Assistant,
                parts: normalizer.ordered_parts(),
                timestamp: now_ms(),
            });
            state.touch();
            state.clone()
        };
        self.inner.store.save_session(&snapshot).await;
    }

    /// Timeout path: the idle signal never came (or the send itself failed).
    /// Try the authoritative fetch once; then fall back to whatever streamed;
    /// then surface the error in the transcript.
    #[allow(clippy::too_many_arguments)]
    async fn recover_prompt(
        &self,
        assistant_message_id: &str,
        normalizer: &EventNormalizer,
        text: &str,
        tunnel_url: &str,
        agent_session_id: &str,
        attempt_fetch: bool,
        failure: String,
    ) -> Result<(), BrokerError> {
        self.inner.broadcaster.flush().await;

        if attempt_fetch {
            if let Ok(messages) = self
                .inner
                .agent
                .fetch_messages(tunnel_url, agent_session_id, RECOVERY_FETCH_TIMEOUT)
                .await
            {
                let recovered = messages
                    .iter()
                    .rev()
                    .find(|message| message.role.as_deref() == Some("assistant"))
                    .map(|message| normalize_fetched_parts(&message.parts, text))
                    .filter(|parts| !parts.is_empty());
                if let Some(parts) = recovered {
                    info!(session_id = %self.inner.session_id, "prompt recovered via message fetch");
                    let assistant = Message {
                        id: assistant_message_id.to_string(),
                        role: MessageRole::Assistant,
                        parts,
                        timestamp: now_ms(),
                    };
                    self.commit_assistant(assistant, None).await;
                    self.auto_snapshot().await;
                    return Ok(());
                }
            }
        }

        let streamed = normalizer.ordered_parts();
        if !streamed.is_empty() {
            let assistant = Message {
                id: assistant_message_id.to_string(),
                role: MessageRole::Assistant,
                parts: streamed,
                timestamp: now_ms(),
            };
            let note = Message::text(MessageRole::System, TIMEOUT_NOTE);
            self.commit_assistant(assistant, Some(note)).await;
            self.auto_snapshot().await;
            return Ok(());
        }

        let note = Message::text(MessageRole::System, format!("Error: {failure}"));
        self.commit_assistant_note_only(note).await;
        Ok(())
    }

    async fn commit_assistant(&self, assistant: Message, note: Option<Message>) {
        // Drain any throttled streaming frame so the committed state frame
        // is the last thing observers see for this prompt.
        self.inner.broadcaster.flush().await;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(state) = state.as_mut() {
                state.append_message(assistant.clone());
                if let Some(note) = note.clone() {
                    state.append_message(note);
                }
                state.streaming_message = None;
                state.is_processing = false;
            }
        }
        self.persist_and_broadcast().await;
        self.sync_message(&assistant).await;
        if let Some(note) = note {
            self.sync_message(&note).await;
        }
        self.sync_status().await;
    }

    async fn commit_assistant_note_only(&self, note: Message) {
        self.inner.broadcaster.flush().await;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(state) = state.as_mut() {
                state.append_message(note.clone());
                state.streaming_message = None;
                state.is_processing = false;
            }
        }
        self.persist_and_broadcast().await;
        self.sync_message(&note).await;
        self.sync_status().await;
    }

    /// Best-effort snapshot after a successful prompt; only while running
    /// and not processing.
    async fn auto_snapshot(&self) {
        let sandbox_id = {
            let state = self.inner.state.lock().await;
            match state.as_ref() {
                Some(state)
                    if state.status == SessionStatus::Running && !state.is_processing =>
                {
                    state.sandbox_id.clone()
                }
                _ => None,
            }
        };
        let Some(sandbox_id) = sandbox_id else { return };
        match self
            .inner
            .provider
            .snapshot_sandbox(&sandbox_id, SNAPSHOT_BACKGROUND_TIMEOUT)
            .await
        {
            Ok(snapshot) => {
                let snapshot_state = {
                    let mut state = self.inner.state.lock().await;
                    if let Some(state) = state.as_mut() {
                        state.snapshot_id = Some(snapshot.snapshot_id);
                        state.touch();
                    }
                    state.clone()
                };
                if let Some(state) = snapshot_state {
                    self.inner.store.save_session(&state).await;
                }
                self.sync_status().await;
            }
            Err(err) => {
                debug!(session_id = %self.inner.session_id, error = %err, "auto-snapshot failed");
            }
        }
    }

    pub async fn pause(&self) -> Result<SessionStateView, BrokerError> {
        let _guard = self.inner.lifecycle.lock().await;

        let sandbox_id = {
            let state = self.inner.state.lock().await;
            let state = state
                .as_ref()
                .ok_or_else(|| BrokerError::bad_request("session not initialized"))?;
            if state.is_processing {
                return Err(BrokerError::Busy);
            }
            if state.status != SessionStatus::Running {
                return Err(BrokerError::bad_request("session is not running"));
            }
            state
                .sandbox_id
                .clone()
                .ok_or_else(|| BrokerError::bad_request("session is not running"))?
        };

        self.transition(|state| {
            state.status = SessionStatus::Starting;
        })
        .await?;

        match self.inner.provider.pause_sandbox(&sandbox_id).await {
            Ok(snapshot) => {
                self.transition(|state| {
                    state.snapshot_id = Some(snapshot.snapshot_id.clone());
                    state.clear_sandbox_refs();
                    state.status = SessionStatus::Paused;
                    state.error = None;
                })
                .await?;
            }
            Err(err) if err.kind == UpstreamKind::Conflict => {
                // Sandbox already dead; keep the last snapshot if we have one.
                self.transition(|state| {
                    state.clear_sandbox_refs();
                    state.status = if state.snapshot_id.is_some() {
                        SessionStatus::Paused
                    } else {
                        SessionStatus::Idle
                    };
                })
                .await?;
            }
            Err(err) => {
                let message = err.to_string();
                self.transition(|state| {
                    state.status = SessionStatus::Error;
                    state.error = Some(message.clone());
                })
                .await?;
                return Err(BrokerError::sandbox_error(message));
            }
        }

        self.view().await
    }

    pub async fn resume(&self) -> Result<SessionStateView, BrokerError> {
        let _guard = self.inner.lifecycle.lock().await;

        {
            let state = self.inner.state.lock().await;
            let state = state
                .as_ref()
                .ok_or_else(|| BrokerError::bad_request("session not initialized"))?;
            if state.status != SessionStatus::Paused || state.snapshot_id.is_none() {
                return Err(BrokerError::bad_request("session is not paused"));
            }
        }

        self.resume_pipeline().await?;
        self.view().await
    }

    /// Rebuilds a sandbox from the stored snapshot. A fresh agent session is
    /// always created; the prior conversation stays in `messages` but the
    /// agent server does not retain it.
    async fn resume_pipeline(&self) -> Result<(), BrokerError> {
        let snapshot_id = {
            let state = self.inner.state.lock().await;
            state
                .as_ref()
                .and_then(|state| state.snapshot_id.clone())
                .ok_or(BrokerError::NoSandbox)?
        };

        self.transition(|state| {
            state.status = SessionStatus::Starting;
            state.error = None;
        })
        .await?;

        let result = async {
            let resumed = self
                .inner
                .provider
                .resume_sandbox(&snapshot_id)
                .await
                .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
            self.inner
                .agent
                .wait_healthy(&resumed.tunnel_url)
                .await
                .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
            let agent_session_id = self
                .inner
                .agent
                .create_agent_session(&resumed.tunnel_url)
                .await
                .map_err(|err| BrokerError::sandbox_error(err.to_string()))?;
            Ok::<BootedSandbox, BrokerError>(BootedSandbox {
                sandbox_id: resumed.sandbox_id,
                tunnel_url: resumed.tunnel_url,
                branch: None,
                agent_session_id,
            })
        }
        .await;

        match result {
            Ok(boot) => {
                self.transition(|state| {
                    state.sandbox_id = Some(boot.sandbox_id);
                    state.sandbox_url = Some(boot.tunnel_url);
                    state.agent_session_id = Some(boot.agent_session_id);
                    state.status = SessionStatus::Running;
                    state.error = None;
                })
                .await?;
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.transition(|state| {
                    state.status = SessionStatus::Error;
                    state.error = Some(message);
                })
                .await?;
                Err(err)
            }
        }
    }

    pub async fn stop(&self) -> Result<SessionStateView, BrokerError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_sse().await;

        let sandbox_id = {
            let state = self.inner.state.lock().await;
            state.as_ref().and_then(|state| state.sandbox_id.clone())
        };
        if let Some(sandbox_id) = sandbox_id {
            self.inner.provider.terminate_sandbox(&sandbox_id).await;
        }

        self.transition(|state| {
            state.clear_sandbox_refs();
            state.status = SessionStatus::Idle;
            state.is_processing = false;
            state.streaming_message = None;
        })
        .await?;

        self.view().await
    }

    async fn cancel_sse(&self) {
        if let Some(task) = self.inner.sse_task.lock().await.take() {
            task.abort();
        }
    }

    /// One state transition: mutate, bump `updatedAt`, write durably,
    /// broadcast the new snapshot, and sync status to the DB of record.
    async fn transition(
        &self,
        mutate: impl FnOnce(&mut SessionState),
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock().await;
            let state = state
                .as_mut()
                .ok_or_else(|| BrokerError::bad_request("session not initialized"))?;
            mutate(state);
        }
        self.persist_and_broadcast().await;
        self.sync_status().await;
        Ok(())
    }

    async fn persist_and_broadcast(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            if let Some(state) = state.as_mut() {
                state.touch();
            }
            state.clone()
        };
        if let Some(state) = snapshot {
            self.inner.store.save_session(&state).await;
            self.inner.broadcaster.state(state.view());
        }
    }

    async fn db(&self) -> Option<DbClient> {
        self.inner.db.lock().await.clone()
    }

    fn status_upsert(state: &SessionState) -> StatusUpsert {
        StatusUpsert {
            session_id: state.session_id.clone(),
            status: state.status.as_str().to_string(),
            is_processing: state.is_processing,
            snapshot_id: state.snapshot_id.clone(),
            error_message: state.error.clone(),
        }
    }

    async fn sync_status(&self) {
        let Some(db) = self.db().await else { return };
        let upsert = {
            let state = self.inner.state.lock().await;
            state.as_ref().map(Self::status_upsert)
        };
        if let Some(upsert) = upsert {
            tokio::spawn(async move {
                db.upsert_status(&upsert).await;
            });
        }
    }

    async fn sync_message(&self, message: &Message) {
        let Some(db) = self.db().await else { return };
        let upsert = MessageUpsert {
            session_id: self.inner.session_id.clone(),
            message_id: message.id.clone(),
            role: message.role.as_str().to_string(),
            parts: serde_json::to_value(&message.parts).unwrap_or(Value::Null),
            timestamp: message.timestamp,
        };
        tokio::spawn(async move {
            db.upsert_message(&upsert).await;
        });
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.inner.broadcaster.clone()
    }
}

struct BootedSandbox {
    sandbox_id: String,
    tunnel_url: String,
    branch: Option<String>,
    agent_session_id: String,
}
