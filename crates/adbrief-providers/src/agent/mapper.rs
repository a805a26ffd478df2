//! Folds raw Messages streaming events into uniform turn events.

use std::collections::HashMap;

use adbrief_types::StreamEvent;
use serde_json::{Value, json};

use super::TurnEvent;
use super::sse::{ApiEvent, BlockType};
use crate::shared::{ProviderError, ProviderResult};

#[derive(Debug)]
struct PendingToolUse {
    id: Option<String>,
    name: String,
    input_json: String,
}

/// Per-message state needed to translate `ApiEvent`s.
///
/// Everything is forwarded as it arrives except tool input, which is
/// buffered until its block closes.
#[derive(Debug, Default)]
pub(crate) struct EventMapper {
    tool_blocks: HashMap<usize, PendingToolUse>,
    message_id: Option<String>,
    text: String,
    stopped: bool,
}

impl EventMapper {
    pub(crate) fn apply(&mut self, event: ApiEvent) -> ProviderResult<Option<TurnEvent>> {
        let mapped = match event {
            ApiEvent::MessageStart { id, model } => {
                self.tool_blocks.clear();
                self.message_id = id;
                self.stopped = false;
                Some(TurnEvent::Metadata {
                    session_id: None,
                    model: Some(model).filter(|m| !m.is_empty()),
                })
            }
            ApiEvent::ContentBlockStart {
                index,
                block_type,
                id,
                name,
            } => match block_type {
                BlockType::Thinking => Some(TurnEvent::Stream(StreamEvent::ThinkingStart)),
                BlockType::ToolUse => {
                    self.tool_blocks.insert(
                        index,
                        PendingToolUse {
                            id,
                            name: name.unwrap_or_default(),
                            input_json: String::new(),
                        },
                    );
                    None
                }
                BlockType::Text => None,
            },
            ApiEvent::TextDelta { text, .. } if !text.is_empty() => {
                self.text.push_str(&text);
                Some(TurnEvent::Stream(StreamEvent::content(text)))
            }
            ApiEvent::ThinkingDelta { thinking, .. } if !thinking.is_empty() => {
                Some(TurnEvent::Stream(StreamEvent::thinking(thinking)))
            }
            ApiEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                if let Some(block) = self.tool_blocks.get_mut(&index) {
                    block.input_json.push_str(&partial_json);
                }
                None
            }
            ApiEvent::ContentBlockStop { index } => self.tool_blocks.remove(&index).map(|block| {
                TurnEvent::Stream(StreamEvent::tool_call(
                    block.id,
                    block.name,
                    parse_tool_input(block.input_json),
                ))
            }),
            ApiEvent::MessageStop => {
                self.stopped = true;
                None
            }
            ApiEvent::Error {
                error_type,
                message,
            } => return Err(ProviderError::api_error(&error_type, &message)),
            _ => None,
        };
        Ok(mapped)
    }

    /// True once `message_stop` was seen for the current message.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Visible text streamed so far, consumed.
    pub(crate) fn take_text(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

fn parse_tool_input(raw: String) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}
