//! Messages API backend: one streaming `POST /v1/messages` per turn.

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::mapper::EventMapper;
use super::sse::SseParser;
use super::{TurnOutcome, TurnSender};
use crate::shared::{ProviderError, ProviderResult, USER_AGENT, classify_reqwest_error};

const API_VERSION: &str = "2023-06-01";

/// Configuration for the Messages API backend.
#[derive(Debug, Clone)]
pub struct MessagesConfig {
    /// Base URL requests are sent to (normally the local proxy).
    pub base_url: String,
    /// Key sent in `api_key_header`; the proxy translates it.
    pub api_key: String,
    pub api_key_header: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct StreamingMessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ApiMessage],
    stream: bool,
}

/// Streams turns from the Messages API and keeps the conversation history.
pub struct MessagesBackend {
    config: MessagesConfig,
    http: reqwest::Client,
    history: Vec<ApiMessage>,
}

impl MessagesBackend {
    pub fn new(config: MessagesConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            history: Vec::new(),
        }
    }

    pub(crate) async fn run_turn(
        &mut self,
        prompt: String,
        tx: &TurnSender,
        cancel: &CancellationToken,
    ) -> ProviderResult<TurnOutcome> {
        self.history.push(ApiMessage {
            role: "user",
            content: prompt,
        });

        match self.stream_reply(tx, cancel).await {
            Ok((outcome, text)) => {
                if !text.is_empty() {
                    self.history.push(ApiMessage {
                        role: "assistant",
                        content: text,
                    });
                }
                Ok(outcome)
            }
            Err(err) => {
                self.history.pop();
                Err(err)
            }
        }
    }

    async fn stream_reply(
        &self,
        tx: &TurnSender,
        cancel: &CancellationToken,
    ) -> ProviderResult<(TurnOutcome, String)> {
        let request = StreamingMessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: self
                .config
                .system_prompt
                .as_deref()
                .filter(|s| !s.trim().is_empty()),
            messages: &self.history,
            stream: true,
        };
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let send = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("user-agent", USER_AGENT)
            .header("anthropic-version", API_VERSION)
            .header(self.config.api_key_header.as_str(), &self.config.api_key)
            .json(&request)
            .send();
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok((TurnOutcome::default(), String::new())),
            sent = send => sent.map_err(|e| classify_reqwest_error(&e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &body));
        }

        let mut events = SseParser::new(response.bytes_stream().boxed());
        let mut mapper = EventMapper::default();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("messages turn cancelled mid-stream");
                    return Ok((TurnOutcome::default(), mapper.take_text()));
                }
                next = events.next() => next,
            };
            let Some(event) = next else {
                return Err(ProviderError::parse("Stream ended before message_stop"));
            };
            if let Some(mapped) = mapper.apply(event?)? {
                tx.send(mapped).await;
            }
            if mapper.is_stopped() {
                let outcome = TurnOutcome {
                    run_id: mapper.message_id().map(str::to_string),
                };
                return Ok((outcome, mapper.take_text()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_omits_blank_system_prompt() {
        let history = vec![ApiMessage {
            role: "user",
            content: "hi".to_string(),
        }];
        let request = StreamingMessagesRequest {
            model: "m",
            max_tokens: 16,
            system: None,
            messages: &history,
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "m",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
        );
    }
}
