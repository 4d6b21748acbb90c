//! HTTP/WebSocket edge: token validation, per-user rate limiting, and
//! dispatch to the session actor that owns each session id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use sandbox_broker_db_client::DbClient;
use sandbox_broker_error::{BrokerError, ErrorType, ProblemDetails};
use sandbox_broker_sandbox_client::ProviderClient;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn, Span};
use utoipa::OpenApi;

use crate::actor::{InitializeCommand, SessionActor};
use crate::broadcaster::Frame;
use crate::session::{now_ms, SessionStateView};
use crate::store::StateStore;

const RATE_LIMIT: u32 = 100;
const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub provider_base_url: String,
    pub provider_api_secret: Option<String>,
    pub db_site_url: String,
    pub state_path: PathBuf,
}

pub struct AppState {
    config: BrokerConfig,
    store: StateStore,
    http: Client,
    provider: ProviderClient,
    db: DbClient,
    actors: Mutex<HashMap<String, SessionActor>>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_start_ms: i64,
}

#[derive(Debug, Clone)]
struct AuthContext {
    user_id: String,
    session_id: String,
    bearer: String,
}

#[derive(Debug, Clone, Copy)]
struct RateInfo {
    remaining: u32,
    reset_at_ms: i64,
}

impl AppState {
    pub async fn new(config: BrokerConfig) -> Result<Self, sqlx::Error> {
        let store = StateStore::open(&config.state_path).await?;
        let http = Client::new();
        let provider = ProviderClient::new(
            http.clone(),
            config.provider_base_url.clone(),
            config.provider_api_secret.clone(),
        );
        let db = DbClient::new(http.clone(), config.db_site_url.clone());
        Ok(Self {
            config,
            store,
            http,
            provider,
            db,
            actors: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves the single actor owning a session id, creating and hydrating
    /// it on first use.
    async fn actor(&self, session_id: &str) -> SessionActor {
        let mut actors = self.actors.lock().await;
        if let Some(actor) = actors.get(session_id) {
            return actor.clone();
        }
        let actor = SessionActor::load(
            session_id.to_string(),
            self.store.clone(),
            self.provider.clone(),
            self.http.clone(),
        )
        .await;
        actors.insert(session_id.to_string(), actor.clone());
        actor
    }

    /// Token-bucket check: 100 requests per rolling 60 s per user, reset
    /// lazily on read.
    async fn check_rate(&self, user_id: &str) -> Result<RateInfo, BrokerError> {
        let now = now_ms();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(user_id.to_string()).or_insert(Bucket {
            count: 0,
            window_start_ms: now,
        });
        if now - bucket.window_start_ms >= RATE_WINDOW_MS {
            bucket.count = 0;
            bucket.window_start_ms = now;
        }
        let reset_at_ms = bucket.window_start_ms + RATE_WINDOW_MS;
        if bucket.count >= RATE_LIMIT {
            return Err(BrokerError::RateLimited { reset_at_ms });
        }
        bucket.count += 1;
        Ok(RateInfo {
            remaining: RATE_LIMIT - bucket.count,
            reset_at_ms,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Broker(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let session_routes = Router::new()
        .route("/sessions", post(create_session))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/prompt", post(post_prompt))
        .route("/sessions/:session_id/pause", post(post_pause))
        .route("/sessions/:session_id/resume", post(post_resume))
        .route("/sessions/:session_id/ws", get(session_ws))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .with_state(state.clone());

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_response(
            |res: &Response, latency: std::time::Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            },
        );

    Router::new()
        .route("/health", get(get_health))
        .merge(session_routes)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        create_session,
        get_session,
        delete_session,
        post_prompt,
        post_pause,
        post_resume
    ),
    components(schemas(
        SessionStateView,
        crate::session::SessionStatus,
        crate::session::Message,
        crate::session::MessagePart,
        crate::session::MessageRole,
        crate::session::ToolCall,
        crate::session::ToolCallState,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session lifecycle and prompting")
    )
)]
pub struct ApiDoc;

/// Accepts either an Authorization bearer header or the WebSocket
/// subprotocol form `"bearer, <token>"`.
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(value.to_string());
    }
    let protocols = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())?;
    let mut parts = protocols.split(',').map(str::trim);
    if parts.next()? != "bearer" {
        return None;
    }
    parts.next().map(|token| token.to_string())
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let Some(bearer) = extract_bearer(request.headers()) else {
        return Err(ApiError::Broker(BrokerError::Unauthorized {
            message: Some("missing bearer token".to_string()),
        })
        .into_response());
    };

    let Some(context) = state.db.validate_token(&bearer).await else {
        return Err(ApiError::Broker(BrokerError::Unauthorized {
            message: Some("invalid bearer token".to_string()),
        })
        .into_response());
    };

    let rate = match state.check_rate(&context.user_id).await {
        Ok(rate) => rate,
        Err(err) => return Err(ApiError::Broker(err).into_response()),
    };

    request.extensions_mut().insert(AuthContext {
        user_id: context.user_id,
        session_id: context.session_id,
        bearer,
    });

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(RATE_LIMIT));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(rate.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(rate.reset_at_ms));
    Ok(response)
}

fn require_session_match(auth: &AuthContext, session_id: &str) -> Result<(), ApiError> {
    if auth.session_id != session_id {
        return Err(ApiError::Broker(BrokerError::Forbidden {
            message: Some("token is not scoped to this session".to_string()),
        }));
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health")),
    tag = "meta"
)]
async fn get_health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": now_ms() }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found" })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    session_id: Option<String>,
    repo: Option<String>,
    #[serde(alias = "model")]
    selected_model: Option<String>,
    provider: Option<String>,
}

#[utoipa::path(
    post,
    path = "/sessions",
    responses(
        (status = 200, body = SessionStateView),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionStateView>, ApiError> {
    let session_id = request
        .session_id
        .ok_or_else(|| BrokerError::bad_request("sessionId is required"))?;
    let repo = request
        .repo
        .ok_or_else(|| BrokerError::bad_request("repo is required"))?;
    require_session_match(&auth, &session_id)?;

    let actor = state.actor(&session_id).await;
    let view = actor
        .initialize(InitializeCommand {
            session_id,
            repo,
            user_id: auth.user_id.clone(),
            bearer: auth.bearer.clone(),
            db_site_url: state.config.db_site_url.clone(),
            selected_model: request.selected_model,
            provider: request.provider,
        })
        .await?;
    Ok(Json(view))
}

#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionStateView),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStateView>, ApiError> {
    require_session_match(&auth, &session_id)?;
    let actor = state.actor(&session_id).await;
    Ok(Json(actor.view().await?))
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    text: Option<String>,
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/prompt",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Prompt accepted and completed"),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_prompt(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session_match(&auth, &session_id)?;
    let text = request
        .text
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| BrokerError::bad_request("text is required"))?;
    let actor = state.actor(&session_id).await;
    actor.prompt(text).await?;
    Ok(Json(json!({ "success": true })))
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/pause",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionStateView),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_pause(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStateView>, ApiError> {
    require_session_match(&auth, &session_id)?;
    let actor = state.actor(&session_id).await;
    Ok(Json(actor.pause().await?))
}

#[utoipa::path(
    post,
    path = "/sessions/{session_id}/resume",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionStateView),
        (status = 400, body = ProblemDetails),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_resume(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStateView>, ApiError> {
    require_session_match(&auth, &session_id)?;
    let actor = state.actor(&session_id).await;
    Ok(Json(actor.resume().await?))
}

#[utoipa::path(
    delete,
    path = "/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session stopped"),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session_match(&auth, &session_id)?;
    let actor = state.actor(&session_id).await;
    actor.stop().await?;
    Ok(Json(json!({ "success": true })))
}

async fn session_ws(
    State(state): State<Arc<AppState>>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Err(err) = require_session_match(&auth, &session_id) {
        return err.into_response();
    }
    let Some(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };
    let actor = state.actor(&session_id).await;
    ws.protocols(["bearer"])
        .on_upgrade(move |socket| handle_session_socket(socket, actor))
}

async fn handle_session_socket(socket: WebSocket, actor: SessionActor) {
    let (view, receiver) = match actor.attach().await {
        Ok(attached) => attached,
        Err(err) => {
            let mut socket = socket;
            let frame = Frame::Error {
                message: err.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(WsMessage::Text(text)).await;
            }
            return;
        }
    };

    let (mut sender, mut incoming) = socket.split();

    if let Ok(text) = serde_json::to_string(&Frame::State(view)) {
        if sender.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }

    let forward = tokio::spawn(async move {
        let mut frames = BroadcastStream::new(receiver);
        while let Some(result) = frames.next().await {
            let frame = match result {
                Ok(frame) => frame,
                Err(_lagged) => {
                    debug!("websocket observer lagged; frames dropped");
                    continue;
                }
            };
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Disconnecting never cancels an in-flight prompt; commands just stop
    // arriving from this socket.
    while let Some(message) = incoming.next().await {
        match message {
            Ok(WsMessage::Text(text)) => handle_client_frame(&actor, &text).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    forward.abort();
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Prompt { text: String },
    Pause,
    Resume,
    Stop,
}

async fn handle_client_frame(actor: &SessionActor, text: &str) {
    let broadcaster = actor.broadcaster();
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            broadcaster.error("unrecognized frame type");
            return;
        }
    };
    let result = match frame {
        ClientFrame::Prompt { text } => {
            let actor = actor.clone();
            tokio::spawn(async move {
                if let Err(err) = actor.prompt(text).await {
                    warn!(session_id = %actor.session_id(), error = %err, "ws prompt failed");
                    actor.broadcaster().error(err.to_string());
                }
            });
            return;
        }
        ClientFrame::Pause => actor.pause().await.map(|_| ()),
        ClientFrame::Resume => actor.resume().await.map(|_| ()),
        ClientFrame::Stop => actor.stop().await.map(|_| ()),
    };
    if let Err(err) = result {
        broadcaster.error(err.to_string());
    }
}
