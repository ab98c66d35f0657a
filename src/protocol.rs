// Boundary decoding for the agent server's event protocol.
//
// The runtime's event schema drifts across builds: payload fields get
// renamed, part shapes gain variants, and bookkeeping events come and go.
// Everything here decodes tolerantly out of raw `serde_json::Value`s into a
// closed tagged union; anything unrecognized lands in `AgentEvent::Unknown`
// so callers can log and drop it instead of crashing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why the agent ended a reasoning/action step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFinishReason {
    Stop,
    EndTurn,
    ToolUse,
    Error,
    /// Anything the runtime invents later; treated like `Stop` downstream.
    Unknown,
}

impl StepFinishReason {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "end_turn" | "end-turn" => Self::EndTurn,
            "tool_use" | "tool-use" => Self::ToolUse,
            "error" => Self::Error,
            other => {
                tracing::debug!("Unknown step-finish reason: {}", other);
                Self::Unknown
            }
        }
    }
}

/// Lifecycle state of a tool part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
    Unknown(String),
}

impl ToolStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "running" | "in_progress" => Self::Running,
            "completed" | "success" => Self::Completed,
            // The runtime has used several spellings for terminal failure
            // states across builds; all of them end the tool call.
            "error" | "failed" | "cancelled" | "canceled" | "denied" | "rejected" | "aborted"
            | "timeout" | "timed_out" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One item of the agent's own task checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: String,
}

impl TodoItem {
    pub fn is_complete(&self) -> bool {
        self.status == "completed"
    }
}

/// Decoded content of a streamed part.
#[derive(Debug, Clone)]
pub enum PartKind {
    Text {
        text: String,
        start_ms: Option<u64>,
        end_ms: Option<u64>,
    },
    Tool {
        name: String,
        status: ToolStatus,
        input: Value,
        output: Option<String>,
        error: Option<String>,
    },
    StepStart,
    StepFinish {
        reason: StepFinishReason,
    },
}

/// The smallest unit of streamed content, carrying the stable identifiers
/// used for session filtering and deduplication.
#[derive(Debug, Clone)]
pub struct EventPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub kind: PartKind,
}

/// A single event pulled off the server's push stream, post-validation.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    PartUpdated {
        part: EventPart,
    },
    SessionError {
        session_id: String,
        error: String,
    },
    SessionIdle {
        session_id: String,
    },
    Unknown {
        event_type: String,
        payload: Value,
    },
}

/// Decode one raw stream payload into an [`AgentEvent`].
///
/// Returns `None` for connection/heartbeat noise (`server.*` events) that
/// carries no session content.
pub fn decode_agent_event(value: &Value) -> Option<AgentEvent> {
    let event_type = value.get("type").and_then(Value::as_str)?.trim();

    // Periodic keep-alive and bookkeeping noise; not tied to any session.
    if event_type.starts_with("server.") {
        return None;
    }

    let props = value.get("properties").unwrap_or(value);

    // Part payloads show up both nested under `properties` and flattened at
    // the top level depending on the runtime build.
    if let Some(part_value) = props.get("part").or_else(|| value.get("part")) {
        if let Some(part) = decode_part(part_value) {
            return Some(AgentEvent::PartUpdated { part });
        }
        return Some(AgentEvent::Unknown {
            event_type: event_type.to_string(),
            payload: value.clone(),
        });
    }

    match event_type {
        "session.error" => {
            let session_id = string_field(props, "sessionID")?;
            let error_value = props.get("error").unwrap_or(&Value::Null);
            let error =
                extract_error_message(error_value).unwrap_or_else(|| error_value.to_string());
            Some(AgentEvent::SessionError { session_id, error })
        }
        "session.idle" => {
            let session_id = string_field(props, "sessionID")?;
            Some(AgentEvent::SessionIdle { session_id })
        }
        _ => Some(AgentEvent::Unknown {
            event_type: event_type.to_string(),
            payload: value.clone(),
        }),
    }
}

fn decode_part(part: &Value) -> Option<EventPart> {
    let session_id = string_field(part, "sessionID")?;
    let message_id = string_field(part, "messageID").unwrap_or_default();
    let part_type = part.get("type").and_then(Value::as_str)?;

    // Tool parts carry both a part id and a call id; the call id is the one
    // that stays stable across the pending -> completed transition.
    let id = string_field(part, "callID")
        .or_else(|| string_field(part, "id"))
        .unwrap_or_default();

    let kind = match part_type {
        "text" | "reasoning" => {
            let text = part
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let time = part.get("time");
            let start_ms = time.and_then(|t| t.get("start")).and_then(Value::as_u64);
            let end_ms = time.and_then(|t| t.get("end")).and_then(Value::as_u64);
            PartKind::Text {
                text,
                start_ms,
                end_ms,
            }
        }
        "tool" | "tool-invocation" => {
            let name = part
                .get("tool")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let state = part.get("state");
            let explicit_status = state
                .and_then(|s| s.get("status"))
                .and_then(Value::as_str)
                .or_else(|| state.and_then(Value::as_str));
            let input = state
                .and_then(|s| s.get("input"))
                .cloned()
                .or_else(|| part.get("args").cloned())
                .unwrap_or(Value::Null);
            let output_value = state
                .and_then(|s| s.get("output"))
                .cloned()
                .or_else(|| part.get("result").cloned());
            let error = state
                .and_then(|s| s.get("error"))
                .or_else(|| part.get("error"))
                .and_then(extract_error_message);
            // Some builds omit the status field on terminal updates; infer
            // from the presence of output/error.
            let status = match explicit_status {
                Some(raw) => ToolStatus::from_wire(raw),
                None if error.is_some() => ToolStatus::Error,
                None if output_value.is_some() => ToolStatus::Completed,
                None => ToolStatus::Pending,
            };
            PartKind::Tool {
                name,
                status,
                input,
                output: output_value.map(|v| value_to_text(&v)),
                error,
            }
        }
        "step-start" => PartKind::StepStart,
        "step-finish" => {
            let reason = part
                .get("reason")
                .or_else(|| part.get("finishReason"))
                .and_then(Value::as_str)
                .map(StepFinishReason::from_wire)
                .unwrap_or(StepFinishReason::Unknown);
            PartKind::StepFinish { reason }
        }
        other => {
            tracing::debug!("Unhandled part type: {}", other);
            return None;
        }
    };

    Some(EventPart {
        id,
        session_id,
        message_id,
        kind,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Pull a human-readable message out of the runtime's assorted error shapes.
pub fn extract_error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => {
            // Prefer the deepest, most specific provider error message.
            if let Some(message) = map
                .get("data")
                .and_then(|data| data.get("error"))
                .and_then(|err| err.get("message"))
                .and_then(Value::as_str)
            {
                return Some(message.to_string());
            }
            if let Some(message) = map
                .get("error")
                .and_then(|err| err.get("message"))
                .and_then(Value::as_str)
            {
                return Some(message.to_string());
            }
            if let Some(message) = map.get("message").and_then(Value::as_str) {
                return Some(message.to_string());
            }
            map.get("name").and_then(Value::as_str).map(str::to_string)
        }
        _ => None,
    }
}
