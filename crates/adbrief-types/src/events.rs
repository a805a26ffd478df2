//! Event types flowing from the agent client to the UI layer.
//!
//! `StreamEvent` is the uniform, backend-agnostic vocabulary the agent client
//! produces. `SessionEvent` is the envelope delivered to session sinks and
//! subscribers. Both serialize with a `type` tag so they can be handed to a
//! UI layer as JSON unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental output of one agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Visible assistant text delta.
    Content { text: String },

    /// Reasoning text delta.
    Thinking { text: String },

    /// A new reasoning block begins; the next thinking delta opens a new segment.
    ThinkingStart,

    /// The agent invoked a tool. Some backends omit the id.
    ToolCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        args: Value,
    },

    /// Result of a previously announced tool call.
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        StreamEvent::Thinking { text: text.into() }
    }

    pub fn tool_call(id: Option<String>, name: impl Into<String>, args: Value) -> Self {
        StreamEvent::ToolCall {
            id,
            name: name.into(),
            args,
        }
    }

    pub fn tool_result(id: Option<String>, result: Value, is_error: bool) -> Self {
        StreamEvent::ToolResult {
            id,
            result,
            is_error,
        }
    }
}

/// Envelope delivered to session sinks.
///
/// `Done` and `Error` are terminal: no further events follow them for the
/// same session. `TurnCompleted` ends one turn of a long-lived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session-level metadata reported by the agent at the start of a turn.
    Metadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// A stream event from the current turn.
    Event { data: StreamEvent },

    /// The agent finished responding to the last message.
    TurnCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },

    /// The session ended normally (input closed or interrupted).
    Done,

    /// The session ended with an error. `message` is user-facing.
    Error { message: String },
}

impl SessionEvent {
    pub fn event(data: StreamEvent) -> Self {
        SessionEvent::Event { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SessionEvent::Error {
            message: message.into(),
        }
    }

    /// Returns true for events after which the session is closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Done | SessionEvent::Error { .. })
    }

    /// Returns true for events that close the current turn.
    pub fn ends_turn(&self) -> bool {
        matches!(self, SessionEvent::TurnCompleted { .. }) || self.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stream_event_uses_type_tag() {
        let value = serde_json::to_value(StreamEvent::content("hi")).unwrap();
        assert_eq!(value, json!({"type": "content", "text": "hi"}));

        let value = serde_json::to_value(StreamEvent::ThinkingStart).unwrap();
        assert_eq!(value, json!({"type": "thinking_start"}));
    }

    #[test]
    fn tool_result_defaults_missing_fields() {
        let parsed: StreamEvent =
            serde_json::from_value(json!({"type": "tool_result", "result": "ok"})).unwrap();
        assert_eq!(
            parsed,
            StreamEvent::ToolResult {
                id: None,
                result: json!("ok"),
                is_error: false,
            }
        );
    }

    #[test]
    fn session_event_wraps_stream_event_as_data() {
        let value =
            serde_json::to_value(SessionEvent::event(StreamEvent::thinking("hmm"))).unwrap();
        assert_eq!(
            value,
            json!({"type": "event", "data": {"type": "thinking", "text": "hmm"}})
        );
    }

    #[test]
    fn terminal_classification() {
        assert!(SessionEvent::Done.is_terminal());
        assert!(SessionEvent::error("boom").is_terminal());
        assert!(!SessionEvent::TurnCompleted { run_id: None }.is_terminal());
        assert!(SessionEvent::TurnCompleted { run_id: None }.ends_turn());
        assert!(!SessionEvent::event(StreamEvent::content("x")).ends_turn());
    }
}
