//! Display segments and finalized assistant messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a tool call.
///
/// Only `Running` may transition; the other states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
    Interrupted,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolStatus::Running)
    }
}

/// A single tool invocation during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: ToolStatus,
}

impl ToolCall {
    pub fn running(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
            status: ToolStatus::Running,
        }
    }

    /// Records a result. Returns false (and changes nothing) if the call
    /// already reached a terminal status.
    pub fn complete(&mut self, result: Value, is_error: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Completed
        };
        self.result = Some(result);
        true
    }

    /// Marks a still-running call as interrupted.
    pub fn interrupt(&mut self) {
        if self.status == ToolStatus::Running {
            self.status = ToolStatus::Interrupted;
        }
    }
}

/// One contiguous unit of display output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Content { text: String },
    Thinking { text: String },
    ToolCall { call: ToolCall },
}

impl Segment {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Content { .. } => SegmentKind::Content,
            Segment::Thinking { .. } => SegmentKind::Thinking,
            Segment::ToolCall { .. } => SegmentKind::ToolCall,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Segment::Content { text } | Segment::Thinking { text } => Some(text),
            Segment::ToolCall { .. } => None,
        }
    }

    pub fn tool_call(&self) -> Option<&ToolCall> {
        match self {
            Segment::ToolCall { call } => Some(call),
            _ => None,
        }
    }
}

/// Discriminant of a `Segment`, used for coalescing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Content,
    Thinking,
    ToolCall,
}

/// An assistant message frozen at the end of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedMessage {
    pub id: String,
    pub role: String,
    /// Concatenated text of all content segments.
    pub content: String,
    pub segments: Vec<Segment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl FinalizedMessage {
    pub fn assistant(content: String, segments: Vec<Segment>, run_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            content,
            segments,
            timestamp: Utc::now(),
            run_id,
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.segments.iter().filter_map(Segment::tool_call)
    }
}
