mod common;

use std::time::Duration;

use common::*;
use sandbox_broker::actor::SessionActor;
use sandbox_broker::session::{
    Message, MessagePart, MessageRole, SessionState, SessionStatus, ToolCallState,
};
use serde_json::json;

const BOOT_BUDGET: Duration = Duration::from_secs(10);
const TIMEOUT_NOTE: &str = "⚠️ Response timed out. Partial content shown above. \
The AI may still be processing — try refreshing in a moment.";

fn shorten_idle_wait() {
    std::env::set_var("BROKER_IDLE_WAIT_MS", "1000");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_stream_recovers_via_message_fetch() {
    shorten_idle_wait();
    let harness = ActorHarness::new("s5").await;
    harness.initialize("s5", "acme/hello", "u1").await;
    harness
        .wait_for_status(SessionStatus::Running, BOOT_BUDGET)
        .await;

    // The stream connects and then goes silent; the turn completed on the
    // agent side anyway.
    harness.agent.push_event_script(vec![ev_connected()]).await;
    harness
        .agent
        .set_messages(Some(agent_messages(
            "Say hi",
            vec![json!({ "type": "text", "text": "late result" })],
        )))
        .await;

    harness
        .actor
        .prompt("Say hi".to_string())
        .await
        .expect("prompt recovers");

    let view = harness.actor.view().await.expect("view");
    assert!(!view.is_processing);
    let last = view.messages.last().expect("assistant");
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(
        last.parts,
        vec![MessagePart::Text { text: "late result".to_string() }]
    );
    // No system note when content was recovered.
    assert!(view
        .messages
        .iter()
        .all(|message| message.role != MessageRole::System));
    assert_invariants(&harness.stored_state("s5").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_stream_preserves_partial_content_with_note() {
    shorten_idle_wait();
    let harness = ActorHarness::new("s6").await;
    harness.initialize("s6", "acme/hello", "u1").await;
    harness
        .wait_for_status(SessionStatus::Running, BOOT_BUDGET)
        .await;

    // Partial streaming, no idle, and the authoritative fetch fails too.
    harness
        .agent
        .push_event_script(vec![
            ev_connected(),
            ev_text("par", "m1"),
            ev_tool("t1", "bash", json!({ "cmd": "ls" }), Some("ok"), "completed"),
        ])
        .await;
    harness.agent.set_messages(None).await;

    harness
        .actor
        .prompt("Say hi".to_string())
        .await
        .expect("prompt preserves partial content");

    let view = harness.actor.view().await.expect("view");
    assert!(!view.is_processing);
    let count = view.messages.len();
    assert!(count >= 3, "user + assistant + note expected, got {count}");

    let assistant = &view.messages[count - 2];
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert_eq!(assistant.parts.len(), 2);
    assert_eq!(
        assistant.parts[0],
        MessagePart::Text { text: "par".to_string() }
    );
    match &assistant.parts[1] {
        MessagePart::Tool { call } => {
            assert_eq!(call.state, ToolCallState::Completed);
            assert_eq!(call.result.as_ref().unwrap(), "ok");
        }
        other => panic!("expected tool part, got {other:?}"),
    }

    let note = &view.messages[count - 1];
    assert_eq!(note.role, MessageRole::System);
    assert_eq!(
        note.parts,
        vec![MessagePart::Text { text: TIMEOUT_NOTE.to_string() }]
    );
    assert_invariants(&harness.stored_state("s6").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_stream_with_nothing_recovered_reports_error_note() {
    shorten_idle_wait();
    let harness = ActorHarness::new("s-empty").await;
    harness.initialize("s-empty", "acme/hello", "u1").await;
    harness
        .wait_for_status(SessionStatus::Running, BOOT_BUDGET)
        .await;

    harness.agent.push_event_script(vec![ev_connected()]).await;
    harness.agent.set_messages(None).await;

    harness
        .actor
        .prompt("Say hi".to_string())
        .await
        .expect("prompt surfaces the failure in the transcript");

    let view = harness.actor.view().await.expect("view");
    assert!(!view.is_processing);
    let note = view.messages.last().expect("system note");
    assert_eq!(note.role, MessageRole::System);
    match &note.parts[0] {
        MessagePart::Text { text } => {
            assert!(text.starts_with("Error: "), "unexpected note: {text}")
        }
        other => panic!("expected text note, got {other:?}"),
    }
    // Nothing streamed, so no assistant message was committed.
    assert!(view
        .messages
        .iter()
        .all(|message| message.role != MessageRole::Assistant));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_recovers_streaming_checkpoint_for_new_observers() {
    let harness = ActorHarness::new("s-restart").await;

    // A previous process persisted a mid-stream checkpoint and then died.
    let mut state = SessionState::new(
        "s-restart".to_string(),
        "acme/hello".to_string(),
        "u1".to_string(),
    );
    state.append_message(Message::text(MessageRole::User, "long task"));
    state.streaming_message = Some(Message {
        id: "assistant-1".to_string(),
        role: MessageRole::Assistant,
        parts: vec![MessagePart::Text { text: "partial progress".to_string() }],
        timestamp: state.created_at,
    });
    harness.store.save_session(&state).await;

    let revived = SessionActor::load(
        "s-restart".to_string(),
        harness.store.clone(),
        harness.provider.client(reqwest::Client::new()),
        reqwest::Client::new(),
    )
    .await;

    let (view, _frames) = revived.attach().await.expect("attach");
    let last = view.messages.last().expect("streamed parts visible");
    assert_eq!(last.id, "assistant-1");
    assert_eq!(
        last.parts,
        vec![MessagePart::Text { text: "partial progress".to_string() }]
    );
}
