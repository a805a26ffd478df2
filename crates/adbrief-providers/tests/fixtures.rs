//! SSE fixture helpers for integration tests.

#![allow(dead_code)]

use wiremock::ResponseTemplate;

const MESSAGE_START: &str = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_123","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4-5","stop_reason":null,"usage":{"input_tokens":10,"output_tokens":1}}}"#;

const MESSAGE_END: &str = r#"event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":5}}

event: message_stop
data: {"type":"message_stop"}"#;

/// Build SSE response with one text block split into `chunks`.
pub fn multi_chunk_text_sse(chunks: &[&str]) -> String {
    let mut events = vec![
        MESSAGE_START.to_string(),
        r#"event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#
            .to_string(),
    ];
    for chunk in chunks {
        events.push(format!(
            r#"event: content_block_delta
data: {{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{}"}}}}"#,
            escape_json(chunk)
        ));
    }
    events.push(
        r#"event: content_block_stop
data: {"type":"content_block_stop","index":0}"#
            .to_string(),
    );
    events.push(MESSAGE_END.to_string());
    events.join("\n\n") + "\n\n"
}

/// Thinking block followed by a text block.
pub fn thinking_then_text_sse(thinking: &str, text: &str) -> String {
    let events = [
        MESSAGE_START.to_string(),
        r#"event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#
            .to_string(),
        format!(
            r#"event: content_block_delta
data: {{"type":"content_block_delta","index":0,"delta":{{"type":"thinking_delta","thinking":"{}"}}}}"#,
            escape_json(thinking)
        ),
        r#"event: content_block_stop
data: {"type":"content_block_stop","index":0}"#
            .to_string(),
        r#"event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#
            .to_string(),
        format!(
            r#"event: content_block_delta
data: {{"type":"content_block_delta","index":1,"delta":{{"type":"text_delta","text":"{}"}}}}"#,
            escape_json(text)
        ),
        r#"event: content_block_stop
data: {"type":"content_block_stop","index":1}"#
            .to_string(),
        MESSAGE_END.to_string(),
    ];
    events.join("\n\n") + "\n\n"
}

/// Message that fails mid-stream with an `error` event.
pub fn error_sse(error_type: &str, message: &str) -> String {
    format!(
        "{MESSAGE_START}\n\nevent: error\ndata: {{\"type\":\"error\",\"error\":{{\"type\":\"{error_type}\",\"message\":\"{}\"}}}}\n\n",
        escape_json(message)
    )
}

/// Wrap SSE body string in a ResponseTemplate.
pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream")
}

/// Escape special characters for JSON string embedding.
fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
