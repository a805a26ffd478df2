//! Agent client: runs one backend turn per outbound message and yields a
//! uniform stream of `SessionEvent`s.
//!
//! Contract of the returned stream:
//! - every turn ends with `turn_completed`,
//! - a backend failure yields exactly one `error` and the stream ends,
//! - closing the message channel or cancelling yields `done` and the stream ends.

mod claude_cli;
mod mapper;
mod messages;
pub mod sse;

use adbrief_types::{SessionEvent, StreamEvent};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use self::claude_cli::{ClaudeCliBackend, ClaudeCliConfig};
pub use self::messages::{MessagesBackend, MessagesConfig};
use crate::shared::ProviderResult;

/// Boxed stream of session events produced by the agent client.
pub type SessionStream = BoxStream<'static, SessionEvent>;

const EVENT_BUFFER: usize = 256;

/// Backend-level output of a turn, before session wrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Metadata {
        session_id: Option<String>,
        model: Option<String>,
    },
    Stream(StreamEvent),
}

impl From<TurnEvent> for SessionEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Metadata { session_id, model } => {
                SessionEvent::Metadata { session_id, model }
            }
            TurnEvent::Stream(data) => SessionEvent::Event { data },
        }
    }
}

/// Result of a turn that ran to completion (or was cancelled).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub run_id: Option<String>,
}

/// Sender handed to backends for emitting turn events.
#[derive(Debug, Clone)]
pub struct TurnSender {
    tx: mpsc::Sender<SessionEvent>,
}

impl TurnSender {
    /// Sends an event, waiting for capacity. Events are never dropped while
    /// the receiver is alive.
    pub async fn send(&self, event: TurnEvent) {
        let _ = self.tx.send(event.into()).await;
    }
}

/// The agent implementations a session can talk to.
pub enum AgentBackend {
    Messages(MessagesBackend),
    ClaudeCli(ClaudeCliBackend),
}

impl AgentBackend {
    pub fn name(&self) -> &'static str {
        match self {
            AgentBackend::Messages(_) => "messages",
            AgentBackend::ClaudeCli(_) => "claude-cli",
        }
    }

    async fn run_turn(
        &mut self,
        prompt: String,
        tx: &TurnSender,
        cancel: &CancellationToken,
    ) -> ProviderResult<TurnOutcome> {
        match self {
            AgentBackend::Messages(backend) => backend.run_turn(prompt, tx, cancel).await,
            AgentBackend::ClaudeCli(backend) => backend.run_turn(prompt, tx, cancel).await,
        }
    }
}

/// Starts a chat over `messages` and returns its event stream.
///
/// Must be called from within a Tokio runtime; the backend is driven by a
/// spawned task that exits once the stream is dropped.
pub fn chat(
    backend: AgentBackend,
    messages: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> SessionStream {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(drive(backend, messages, cancel, tx));

    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed()
}

async fn drive(
    mut backend: AgentBackend,
    mut messages: mpsc::Receiver<String>,
    cancel: CancellationToken,
    tx: mpsc::Sender<SessionEvent>,
) {
    let sender = TurnSender { tx: tx.clone() };
    let backend_name = backend.name();

    loop {
        let prompt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tx.closed() => return,
            next = messages.recv() => match next {
                Some(prompt) => prompt,
                None => break,
            },
        };

        debug!(backend = backend_name, "starting turn");
        match backend.run_turn(prompt, &sender, &cancel).await {
            Ok(_) if cancel.is_cancelled() => {
                debug!(backend = backend_name, "turn cancelled");
                break;
            }
            Ok(outcome) => {
                let _ = tx
                    .send(SessionEvent::TurnCompleted {
                        run_id: outcome.run_id,
                    })
                    .await;
            }
            Err(err) => {
                warn!(backend = backend_name, kind = %err.kind, "turn failed: {err}");
                let _ = tx.send(SessionEvent::error(err.user_message())).await;
                return;
            }
        }
    }

    let _ = tx.send(SessionEvent::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_events_wrap_into_session_events() {
        let event: SessionEvent = TurnEvent::Stream(StreamEvent::content("hi")).into();
        assert_eq!(event, SessionEvent::event(StreamEvent::content("hi")));

        let event: SessionEvent = TurnEvent::Metadata {
            session_id: Some("s".to_string()),
            model: None,
        }
        .into();
        assert!(matches!(event, SessionEvent::Metadata { .. }));
    }

    #[tokio::test]
    async fn closing_the_channel_yields_done() {
        let backend = AgentBackend::Messages(MessagesBackend::new(MessagesConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: String::new(),
            api_key_header: "x-api-key".to_string(),
            model: "m".to_string(),
            max_tokens: 16,
            system_prompt: None,
        }));
        let (msg_tx, msg_rx) = mpsc::channel(1);
        drop(msg_tx);

        let events: Vec<_> = chat(backend, msg_rx, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events, vec![SessionEvent::Done]);
    }

    #[tokio::test]
    async fn cancel_while_idle_yields_done() {
        let backend = AgentBackend::ClaudeCli(ClaudeCliBackend::new(ClaudeCliConfig {
            program: "claude".into(),
            base_url: String::new(),
            api_key: String::new(),
            model: None,
            system_prompt: None,
            working_dir: None,
        }));
        let (_msg_tx, msg_rx) = mpsc::channel::<String>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events: Vec<_> = chat(backend, msg_rx, cancel).collect().await;
        assert_eq!(events, vec![SessionEvent::Done]);
    }
}
