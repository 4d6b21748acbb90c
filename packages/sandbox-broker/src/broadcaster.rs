//! Fan-out of session frames to every attached WebSocket. Frames are pushed
//! through one broadcast channel so all sockets observe them in the order
//! the actor produced them; streaming frames are throttled to one per
//! cooldown window with a single deferred flush.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};

use crate::session::{MessagePart, SessionStateView};

pub const STREAM_THROTTLE: Duration = Duration::from_millis(100);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingPayload {
    pub message_id: String,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    State(SessionStateView),
    Event(Value),
    Streaming(StreamingPayload),
    Error { message: String },
}

#[derive(Debug, Default)]
struct Throttle {
    last_emit: Option<Instant>,
    pending: Option<StreamingPayload>,
    scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: broadcast::Sender<Frame>,
    throttle: Mutex<Throttle>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tx,
                throttle: Mutex::new(Throttle::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.tx.subscribe()
    }

    pub fn state(&self, view: SessionStateView) {
        let _ = self.inner.tx.send(Frame::State(view));
    }

    pub fn event(&self, raw: Value) {
        let _ = self.inner.tx.send(Frame::Event(raw));
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.inner.tx.send(Frame::Error {
            message: message.into(),
        });
    }

    /// Emits a streaming frame, or stores it for the deferred flush when a
    /// frame already went out inside the cooldown window.
    pub async fn streaming(&self, payload: StreamingPayload) {
        let mut throttle = self.inner.throttle.lock().await;
        let now = Instant::now();
        if let Some(last_emit) = throttle.last_emit {
            let elapsed = now.duration_since(last_emit);
            if elapsed < STREAM_THROTTLE {
                throttle.pending = Some(payload);
                if !throttle.scheduled {
                    throttle.scheduled = true;
                    let broadcaster = self.clone();
                    let delay = STREAM_THROTTLE - elapsed;
                    tokio::spawn(async move {
                        sleep(delay).await;
                        broadcaster.flush_deferred().await;
                    });
                }
                return;
            }
        }
        throttle.last_emit = Some(now);
        let _ = self.inner.tx.send(Frame::Streaming(payload));
    }

    async fn flush_deferred(&self) {
        let mut throttle = self.inner.throttle.lock().await;
        throttle.scheduled = false;
        if let Some(payload) = throttle.pending.take() {
            throttle.last_emit = Some(Instant::now());
            let _ = self.inner.tx.send(Frame::Streaming(payload));
        }
    }

    /// Drains any pending streaming update so the caller's next `state`
    /// frame is guaranteed to follow the last streaming frame.
    pub async fn flush(&self) {
        let mut throttle = self.inner.throttle.lock().await;
        if let Some(payload) = throttle.pending.take() {
            throttle.last_emit = Some(Instant::now());
            let _ = self.inner.tx.send(Frame::Streaming(payload));
        }
    }
}
