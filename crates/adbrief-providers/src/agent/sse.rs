//! Anthropic Messages streaming events.
//!
//! The same event vocabulary arrives two ways: as SSE frames from the
//! Messages API, and as `stream_event` lines from the Claude CLI. Both go
//! through `parse_event_fields`.

use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::Deserialize;

use crate::shared::{ProviderError, ProviderResult};

/// Content block kinds that open with `content_block_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Text,
    ToolUse,
    Thinking,
}

impl BlockType {
    fn parse(value: &str) -> ProviderResult<Self> {
        match value {
            "text" => Ok(Self::Text),
            "tool_use" | "server_tool_use" => Ok(Self::ToolUse),
            "thinking" | "redacted_thinking" => Ok(Self::Thinking),
            other => Err(ProviderError::parse(format!(
                "Unknown content block type: {other}"
            ))),
        }
    }
}

/// One raw event of the Messages streaming protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
    MessageStart {
        id: Option<String>,
        model: String,
    },
    ContentBlockStart {
        index: usize,
        block_type: BlockType,
        /// For `tool_use` blocks: the tool use ID
        id: Option<String>,
        /// For `tool_use` blocks: the tool name
        name: Option<String>,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    SignatureDelta {
        index: usize,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
    },
    MessageStop,
    Ping,
    Error {
        error_type: String,
        message: String,
    },
}

/// SSE parser that converts a byte stream into `ApiEvent`s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<ApiEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                Poll::Ready(Some(parse_event_fields(&event.event, &event.data)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ProviderError::parse(format!(
                "SSE stream error: {e}"
            ))))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn parse_data<'a, T: Deserialize<'a>>(event_type: &str, data: Option<&'a str>) -> ProviderResult<T> {
    let data =
        data.ok_or_else(|| ProviderError::parse(format!("Missing data for {event_type}")))?;
    serde_json::from_str(data)
        .map_err(|err| ProviderError::parse(format!("Failed to parse {event_type}: {err}")))
}

/// Parses one event given its type name and JSON payload.
pub fn parse_event_fields(event_type: &str, data: &str) -> ProviderResult<ApiEvent> {
    let data = if data.trim().is_empty() {
        None
    } else {
        Some(data)
    };

    match event_type {
        "ping" => Ok(ApiEvent::Ping),
        "message_start" => {
            let parsed: SseMessageStart = parse_data(event_type, data)?;
            Ok(ApiEvent::MessageStart {
                id: parsed.message.id,
                model: parsed.message.model,
            })
        }
        "content_block_start" => {
            let parsed: SseContentBlockStart = parse_data(event_type, data)?;
            Ok(ApiEvent::ContentBlockStart {
                index: parsed.index,
                block_type: BlockType::parse(&parsed.content_block.block_type)?,
                id: parsed.content_block.id,
                name: parsed.content_block.name,
            })
        }
        "content_block_delta" => {
            let parsed: SseContentBlockDelta = parse_data(event_type, data)?;
            let index = parsed.index;
            match parsed.delta.delta_type.as_str() {
                "text_delta" => Ok(ApiEvent::TextDelta {
                    index,
                    text: parsed.delta.text.unwrap_or_default(),
                }),
                "input_json_delta" => Ok(ApiEvent::InputJsonDelta {
                    index,
                    partial_json: parsed.delta.partial_json.unwrap_or_default(),
                }),
                "thinking_delta" => Ok(ApiEvent::ThinkingDelta {
                    index,
                    thinking: parsed.delta.thinking.unwrap_or_default(),
                }),
                "signature_delta" => Ok(ApiEvent::SignatureDelta { index }),
                other => Err(ProviderError::parse(format!("Unknown delta type: {other}"))),
            }
        }
        "content_block_stop" => {
            let parsed: SseIndex = parse_data(event_type, data)?;
            Ok(ApiEvent::ContentBlockStop {
                index: parsed.index,
            })
        }
        "message_delta" => {
            let parsed: SseMessageDelta = parse_data(event_type, data)?;
            Ok(ApiEvent::MessageDelta {
                stop_reason: parsed.delta.stop_reason,
            })
        }
        "message_stop" => Ok(ApiEvent::MessageStop),
        "error" => {
            let parsed: SseError = parse_data(event_type, data)?;
            Ok(ApiEvent::Error {
                error_type: parsed.error.error_type,
                message: parsed.error.message,
            })
        }
        other => Err(ProviderError::parse(format!(
            "Unknown SSE event type: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct SseMessageStart {
    message: SseMessageInfo,
}

#[derive(Debug, Deserialize)]
struct SseMessageInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockStart {
    index: usize,
    content_block: SseContentBlock,
}

#[derive(Debug, Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockDelta {
    index: usize,
    delta: SseDelta,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseIndex {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct SseMessageDelta {
    delta: SseMessageDeltaInner,
}

#[derive(Debug, Deserialize)]
struct SseMessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorInfo,
}

#[derive(Debug, Deserialize)]
struct SseErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    const SSE_THINKING_THEN_TOOL: &str = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4-5","usage":{"input_tokens":10,"output_tokens":1}}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"step1"}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Skill"}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"skill\":"}}

event: ping
data: {"type":"ping"}

event: message_stop
data: {"type":"message_stop"}

"#;

    fn chunked(
        data: &str,
        size: usize,
    ) -> impl Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> + Unpin {
        let chunks: Vec<_> = data
            .as_bytes()
            .chunks(size)
            .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
            .collect();
        futures_util::stream::iter(chunks)
    }

    async fn collect(data: &str, size: usize) -> Vec<ApiEvent> {
        let mut parser = SseParser::new(chunked(data, size));
        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("Expected valid event"));
        }
        events
    }

    #[tokio::test]
    async fn parses_thinking_and_tool_use_blocks() {
        let events = collect(SSE_THINKING_THEN_TOOL, 50).await;

        assert_eq!(events.len(), 9);
        assert_eq!(
            events[0],
            ApiEvent::MessageStart {
                id: Some("msg_1".to_string()),
                model: "claude-sonnet-4-5".to_string(),
            }
        );
        assert!(matches!(
            events[1],
            ApiEvent::ContentBlockStart {
                index: 0,
                block_type: BlockType::Thinking,
                ..
            }
        ));
        assert_eq!(
            events[2],
            ApiEvent::ThinkingDelta {
                index: 0,
                thinking: "step1".to_string()
            }
        );
        assert_eq!(events[3], ApiEvent::SignatureDelta { index: 0 });
        assert!(matches!(
            &events[5],
            ApiEvent::ContentBlockStart {
                index: 1,
                block_type: BlockType::ToolUse,
                id: Some(id),
                name: Some(name),
            } if id == "toolu_1" && name == "Skill"
        ));
        assert_eq!(events[8], ApiEvent::MessageStop);
    }

    #[tokio::test]
    async fn tiny_chunks_yield_same_events() {
        let big = collect(SSE_THINKING_THEN_TOOL, 4096).await;
        let tiny = collect(SSE_THINKING_THEN_TOOL, 3).await;
        assert_eq!(big, tiny);
    }

    #[test]
    fn error_event_is_parsed() {
        let event = parse_event_fields(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ApiEvent::Error {
                error_type: "overloaded_error".to_string(),
                message: "busy".to_string(),
            }
        );
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let err = parse_event_fields("mystery", "{}").unwrap_err();
        assert!(err.message.contains("mystery"));
    }
}
