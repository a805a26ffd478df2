//! Folds the agent's event stream into ordered display segments.
//!
//! Coalescing rules:
//! - a delta of the same kind as the trailing segment is appended to it,
//! - `thinking_start` forces the next thinking delta into a new segment,
//! - every tool call is its own segment,
//! - empty deltas change nothing.

use adbrief_types::{FinalizedMessage, Segment, StreamEvent, ToolCall, ToolStatus};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SegmentAccumulator {
    segments: Vec<Segment>,
    pending_boundary: bool,
    next_call: usize,
}

impl SegmentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content { text } => self.push_text(false, text),
            StreamEvent::Thinking { text } => self.push_text(true, text),
            StreamEvent::ThinkingStart => self.pending_boundary = true,
            StreamEvent::ToolCall { id, name, args } => {
                self.next_call += 1;
                let id = id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .map_or_else(|| format!("call_{}", self.next_call), str::to_string);
                self.push(Segment::ToolCall {
                    call: ToolCall::running(id, name.clone(), args.clone()),
                });
            }
            StreamEvent::ToolResult {
                id,
                result,
                is_error,
            } => self.complete_call(id.as_deref(), result, *is_error),
        }
    }

    fn push_text(&mut self, thinking: bool, text: &str) {
        if text.is_empty() {
            return;
        }
        let boundary = thinking && self.pending_boundary;
        match self.segments.last_mut() {
            Some(Segment::Thinking { text: tail }) if thinking && !boundary => tail.push_str(text),
            Some(Segment::Content { text: tail }) if !thinking => tail.push_str(text),
            _ => {
                let text = text.to_string();
                self.push(if thinking {
                    Segment::Thinking { text }
                } else {
                    Segment::Content { text }
                });
            }
        }
    }

    fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
        self.pending_boundary = false;
    }

    /// Applies a tool result to the running call with the same id or, when
    /// the id is missing or unknown, to the only running call.
    fn complete_call(&mut self, id: Option<&str>, result: &Value, is_error: bool) {
        let known_id = id.filter(|id| {
            self.segments
                .iter()
                .filter_map(Segment::tool_call)
                .any(|call| call.id == *id)
        });

        let target = match known_id {
            Some(id) => self.running_calls().find(|call| call.id == id),
            None => {
                let mut running = self.running_calls();
                match (running.next(), running.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            }
        };

        match target {
            Some(call) => {
                call.complete(result.clone(), is_error);
            }
            None => debug!(?id, "tool result has no running call to attach to"),
        }
    }

    fn running_calls(&mut self) -> impl Iterator<Item = &mut ToolCall> {
        self.segments.iter_mut().filter_map(|segment| match segment {
            Segment::ToolCall { call } if call.status == ToolStatus::Running => Some(call),
            _ => None,
        })
    }

    /// Freezes the accumulated segments into a message and resets.
    ///
    /// Returns `None` when nothing was accumulated.
    pub fn finalize(&mut self, run_id: Option<String>) -> Option<FinalizedMessage> {
        self.pending_boundary = false;
        let segments = freeze(std::mem::take(&mut self.segments));
        if segments.is_empty() {
            return None;
        }
        let content: String = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        Some(FinalizedMessage::assistant(content, segments, run_id))
    }
}

/// Drops a trailing empty thinking segment and interrupts running calls.
fn freeze(mut segments: Vec<Segment>) -> Vec<Segment> {
    if matches!(segments.last(), Some(Segment::Thinking { text }) if text.is_empty()) {
        segments.pop();
    }
    for segment in &mut segments {
        if let Segment::ToolCall { call } = segment {
            call.interrupt();
        }
    }
    segments
}
