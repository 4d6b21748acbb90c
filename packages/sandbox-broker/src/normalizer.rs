//! Normalizes the agent server's raw SSE events into ordered message parts.
//!
//! The agent event schema spells tool fields several ways depending on the
//! server build; every alias lives in `RawPart` so adding a new variant is a
//! one-line change. `classify` is pure; the `EventNormalizer` adds identity
//! and ordering on top of it.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::session::{fresh_id, now_ms, MessagePart, ToolCall, ToolCallState};

const TOOL_PART_TYPES: [&str; 5] = ["tool", "tool-call", "tool_call", "tool-invocation", "tool_use"];

#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPart {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub part_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "toolName")]
    pub tool_name: Option<String>,
    #[serde(default, alias = "callID")]
    pub call_id: Option<String>,
    #[serde(default, alias = "toolCallId")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<RawPartState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPartState {
    Detailed {
        #[serde(default)]
        input: Option<Value>,
        #[serde(default)]
        output: Option<Value>,
        #[serde(default)]
        status: Option<String>,
    },
    Label(String),
}

/// Result of classifying one raw part. Tool fields are optional so that a
/// partial update (e.g. a completion carrying only output/status) can be
/// merged onto the tracked part without clobbering earlier fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Text {
        id: Option<String>,
        text: String,
    },
    Tool {
        id: Option<String>,
        name: Option<String>,
        arguments: Option<Map<String, Value>>,
        result: Option<Value>,
        state: Option<ToolCallState>,
    },
}

/// Pure classifier. Returns `None` for empty text, echoes of the user's own
/// prompt, and part types we do not recognize.
pub fn classify(part: &RawPart, user_prompt: &str) -> Option<Classified> {
    let part_type = part.part_type.as_deref()?;

    if part_type == "text" {
        let text = part.text.as_deref()?;
        if text.is_empty() || text == user_prompt {
            return None;
        }
        return Some(Classified::Text {
            id: part.id.clone(),
            text: text.to_string(),
        });
    }

    if !TOOL_PART_TYPES.contains(&part_type) {
        return None;
    }

    let (state_input, state_output, state_status) = match &part.state {
        Some(RawPartState::Detailed {
            input,
            output,
            status,
        }) => (input.clone(), output.clone(), status.clone()),
        Some(RawPartState::Label(label)) => (None, None, Some(label.clone())),
        None => (None, None, None),
    };

    let name = part
        .tool
        .clone()
        .or_else(|| part.name.clone())
        .or_else(|| part.tool_name.clone());
    let id = part
        .id
        .clone()
        .or_else(|| part.call_id.clone())
        .or_else(|| part.tool_call_id.clone());
    let arguments = state_input
        .or_else(|| part.input.clone())
        .or_else(|| part.arguments.clone())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        });
    let result = state_output
        .or_else(|| part.output.clone())
        .or_else(|| part.result.clone());
    let state = state_status
        .or_else(|| part.status.clone())
        .as_deref()
        .and_then(map_tool_state);

    Some(Classified::Tool {
        id,
        name,
        arguments,
        result,
        state,
    })
}

fn map_tool_state(raw: &str) -> Option<ToolCallState> {
    match raw {
        "pending" => Some(ToolCallState::Pending),
        "running" => Some(ToolCallState::Running),
        "completed" | "success" => Some(ToolCallState::Completed),
        "error" | "failed" => Some(ToolCallState::Error),
        _ => None,
    }
}

/// What the caller learns from one observed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Connected,
    Idle,
    PartsChanged,
    Error(String),
    Ignored,
}

#[derive(Debug, Clone)]
struct TrackedPart {
    first_seen: u64,
    part: MessagePart,
}

/// Accumulates the parts of the in-flight assistant message, keyed by a
/// stable part id and ordered by first appearance.
#[derive(Debug)]
pub struct EventNormalizer {
    user_prompt: String,
    parts: HashMap<String, TrackedPart>,
    next_seen: u64,
    current_text_id: Option<String>,
}

impl EventNormalizer {
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            parts: HashMap::new(),
            next_seen: 0,
            current_text_id: None,
        }
    }

    pub fn observe_value(&mut self, value: &Value) -> Observation {
        let Ok(event) = serde_json::from_value::<RawEvent>(value.clone()) else {
            return Observation::Ignored;
        };
        self.observe(&event)
    }

    pub fn observe(&mut self, event: &RawEvent) -> Observation {
        match event.event_type.as_str() {
            "server.connected" => Observation::Connected,
            "session.idle" => Observation::Idle,
            "message.part.updated" => self.handle_part_updated(event.properties.as_ref()),
            "message.start" | "message.complete" => Observation::Ignored,
            "error" => {
                let message = event
                    .properties
                    .as_ref()
                    .and_then(|properties| properties.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("agent error")
                    .to_string();
                Observation::Error(message)
            }
            _ => Observation::Ignored,
        }
    }

    fn handle_part_updated(&mut self, properties: Option<&Value>) -> Observation {
        let Some(properties) = properties else {
            return Observation::Ignored;
        };
        let Some(raw_part) = properties.get("part") else {
            return Observation::Ignored;
        };
        let Ok(raw_part) = serde_json::from_value::<RawPart>(raw_part.clone()) else {
            return Observation::Ignored;
        };
        let index = properties.get("index").and_then(|value| {
            value
                .as_u64()
                .map(|index| index.to_string())
                .or_else(|| value.as_str().map(|index| index.to_string()))
        });

        match classify(&raw_part, &self.user_prompt) {
            Some(Classified::Text { id, text }) => {
                let part_id = id
                    .or_else(|| index.map(|index| format!("text-{index}")))
                    .or_else(|| self.current_text_id.clone())
                    .unwrap_or_else(|| format!("text-{}", now_ms()));
                self.upsert(part_id.clone(), MessagePart::Text { text });
                self.current_text_id = Some(part_id);
                Observation::PartsChanged
            }
            Some(Classified::Tool {
                id,
                name,
                arguments,
                result,
                state,
            }) => {
                let part_id = id.unwrap_or_else(fresh_id);
                let previous = self.parts.get(&part_id).and_then(|tracked| {
                    match &tracked.part {
                        MessagePart::Tool { call } => Some(call.clone()),
                        MessagePart::Text { .. } => None,
                    }
                });
                let merged = merge_tool_call(&part_id, previous, name, arguments, result, state);
                self.upsert(part_id, MessagePart::Tool { call: merged });
                // Later text opens a fresh part instead of extending the old one.
                self.current_text_id = None;
                Observation::PartsChanged
            }
            None => Observation::Ignored,
        }
    }

    fn upsert(&mut self, part_id: String, part: MessagePart) {
        match self.parts.get_mut(&part_id) {
            Some(tracked) => tracked.part = part,
            None => {
                let first_seen = self.next_seen;
                self.next_seen += 1;
                self.parts.insert(part_id, TrackedPart { first_seen, part });
            }
        }
    }

    /// Canonical ordered parts: sorted by first appearance, empty text
    /// dropped.
    pub fn ordered_parts(&self) -> Vec<MessagePart> {
        let mut tracked: Vec<&TrackedPart> = self.parts.values().collect();
        tracked.sort_by_key(|tracked| tracked.first_seen);
        tracked
            .into_iter()
            .map(|tracked| tracked.part.clone())
            .filter(|part| match part {
                MessagePart::Text { text } => !text.is_empty(),
                MessagePart::Tool { .. } => true,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_parts().is_empty()
    }
}

fn merge_tool_call(
    part_id: &str,
    previous: Option<ToolCall>,
    name: Option<String>,
    arguments: Option<Map<String, Value>>,
    result: Option<Value>,
    state: Option<ToolCallState>,
) -> ToolCall {
    match previous {
        Some(mut call) => {
            if let Some(name) = name {
                call.name = name;
            }
            if let Some(arguments) = arguments {
                call.arguments = arguments;
            }
            if result.is_some() {
                call.result = result;
            }
            if let Some(state) = state {
                call.state = state;
            }
            call
        }
        None => ToolCall {
            id: part_id.to_string(),
            name: name.unwrap_or_else(|| "unknown".to_string()),
            arguments: arguments.unwrap_or_default(),
            result,
            state: state.unwrap_or(ToolCallState::Running),
        },
    }
}

/// Runs the classifier over an authoritative message's raw parts, preserving
/// their order. Used to reconcile the final fetch against the streamed parts.
pub fn normalize_fetched_parts(raw_parts: &[Value], user_prompt: &str) -> Vec<MessagePart> {
    let mut normalizer = EventNormalizer::new(user_prompt);
    for (index, raw) in raw_parts.iter().enumerate() {
        let properties = serde_json::json!({ "part": raw, "index": index });
        normalizer.handle_part_updated(Some(&properties));
    }
    normalizer.ordered_parts()
}

pub fn tool_part_count(parts: &[MessagePart]) -> usize {
    parts
        .iter()
        .filter(|part| matches!(part, MessagePart::Tool { .. }))
        .count()
}

pub fn text_length(parts: &[MessagePart]) -> usize {
    parts
        .iter()
        .map(|part| match part {
            MessagePart::Text { text } => text.len(),
            MessagePart::Tool { .. } => 0,
        })
        .sum()
}
