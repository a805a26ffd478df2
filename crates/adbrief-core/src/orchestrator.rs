//! Control surface for a UI layer.
//!
//! Wires the session manager, the segment accumulator and the skill merge
//! together. Events flow agent -> session sink -> consumer task, which
//! folds them into messages, applies skill output and fans everything out
//! to subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adbrief_providers::agent::{
    AgentBackend, ClaudeCliBackend, ClaudeCliConfig, MessagesBackend, MessagesConfig,
    SessionStream,
};
use adbrief_providers::proxy::{AuthProxy, ProxyConfig};
use adbrief_types::{FinalizedMessage, Section, SessionEvent};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BackendKind, Config};
use crate::documents::{DocumentStore, JsonFileDocumentStore};
use crate::session::{SessionError, SessionManager};
use crate::skills::{MergeReport, SkillRegistry, apply_skill_output};
use crate::stream::SegmentAccumulator;

/// Builds the agent event stream for a new session.
pub type ChatFactory =
    Arc<dyn Fn(mpsc::Receiver<String>, CancellationToken) -> SessionStream + Send + Sync>;

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Session(SessionEvent),
    MessageFinalized(FinalizedMessage),
    SkillApplied { skill: String, report: MergeReport },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStarted {
    pub session_id: String,
}

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<Arc<UiEvent>>>>>;

/// A live event feed. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Arc<UiEvent>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<UiEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<UiEvent>> {
        self.rx.try_recv().ok()
    }
}

/// Assembled pieces for an `Orchestrator`.
pub struct OrchestratorParts {
    pub chat: ChatFactory,
    pub store: Arc<dyn DocumentStore>,
    pub skills: SkillRegistry,
    pub stall_timeout: Duration,
    pub channel_capacity: usize,
}

pub struct Orchestrator {
    sessions: SessionManager,
    chat: ChatFactory,
    shared: Arc<Shared>,
    channel_capacity: usize,
    consumer: Mutex<Option<JoinHandle<()>>>,
    proxy: Option<AuthProxy>,
}

/// State shared with the consumer task.
struct Shared {
    store: Arc<dyn DocumentStore>,
    skills: SkillRegistry,
    subscribers: Subscribers,
    history: Mutex<Vec<FinalizedMessage>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            sessions: SessionManager::new(parts.stall_timeout),
            chat: parts.chat,
            shared: Arc::new(Shared {
                store: parts.store,
                skills: parts.skills,
                subscribers: Arc::default(),
                history: Mutex::default(),
            }),
            channel_capacity: parts.channel_capacity.max(1),
            consumer: Mutex::new(None),
            proxy: None,
        }
    }

    /// Builds an orchestrator from config: opens the document store, starts
    /// the auth proxy and points the configured backend at it.
    ///
    /// # Errors
    /// Returns an error if no API key is configured, the upstream URL is
    /// invalid, the store cannot be opened or the proxy cannot start.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key()?;
        let upstream = config.upstream_url()?;
        let store = JsonFileDocumentStore::open(config.documents_path())?;

        let proxy = AuthProxy::new(ProxyConfig {
            key_header: config.proxy.api_key_header.clone(),
            auth_scheme: config.proxy.auth_scheme.clone(),
            fallback_api_key: Some(api_key.clone()),
        });
        let local_url = proxy
            .start(upstream)
            .await
            .context("Failed to start auth proxy")?;

        let chat = backend_factory(config, &local_url, api_key);
        let mut orchestrator = Self::new(OrchestratorParts {
            chat,
            store: Arc::new(store),
            skills: SkillRegistry::with_custom(&config.skills.custom),
            stall_timeout: config.session.stall_timeout(),
            channel_capacity: config.session.channel_capacity(),
        });
        orchestrator.proxy = Some(proxy);
        Ok(orchestrator)
    }

    pub fn proxy(&self) -> Option<&AuthProxy> {
        self.proxy.as_ref()
    }

    /// Starts a session and the task that consumes its events.
    ///
    /// The previous session's consumer is drained first, so its last message
    /// is finalized and merged before the new session starts.
    ///
    /// # Errors
    /// Returns an error if a session is already active.
    pub async fn start_session(&self) -> Result<SessionStarted> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (sink, events) = mpsc::channel(self.channel_capacity);
        let chat = Arc::clone(&self.chat);
        self.sessions
            .create_session(session_id.clone(), sink, move |messages, cancel| {
                chat(messages, cancel)
            })?;

        let previous = lock(&self.consumer).take();
        if let Some(previous) = previous {
            join_consumer(previous).await;
        }
        let consumer = tokio::spawn(consume(events, Arc::clone(&self.shared)));
        *lock(&self.consumer) = Some(consumer);
        Ok(SessionStarted { session_id })
    }

    /// Sends user input to the active session.
    ///
    /// # Errors
    /// Returns an error if the content is blank, no session is active or the
    /// agent stopped accepting messages.
    pub async fn send_message(&self, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            bail!("Message is empty");
        }
        self.sessions.push_message(content).await?;
        Ok(())
    }

    /// Interrupts the active session and waits until its last message is
    /// finalized. Does nothing when no session is active.
    pub async fn stop_session(&self) {
        match self.sessions.interrupt_session().await {
            Ok(()) => {}
            Err(SessionError::NoActiveSession) => debug!("stop requested with no active session"),
            Err(err) => warn!("failed to interrupt session: {err}"),
        }
        let consumer = lock(&self.consumer).take();
        if let Some(consumer) = consumer {
            join_consumer(consumer).await;
        }
    }

    pub fn has_session(&self) -> bool {
        self.sessions.has_session()
    }

    pub fn session_id(&self) -> Option<String> {
        self.sessions.session_id()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        lock(&self.shared.subscribers).push(tx);
        Subscription { rx }
    }

    /// Applies a user edit. The field is protected from later merges.
    ///
    /// # Errors
    /// Returns an error if the store cannot persist the edit.
    pub fn edit_field(&self, section: &str, field: &str, value: Value) -> Result<()> {
        self.shared.store.mark_user_edit(section, field, value)
    }

    /// # Errors
    /// Returns an error if the store cannot persist the change.
    pub fn set_section_locked(&self, section: &str, locked: bool) -> Result<()> {
        self.shared.store.set_locked(section, locked)
    }

    pub fn section(&self, section: &str) -> Option<Section> {
        self.shared.store.get(section)
    }

    /// Messages finalized so far, oldest first.
    pub fn history(&self) -> Vec<FinalizedMessage> {
        lock(&self.shared.history).clone()
    }

    /// Stops the session and the proxy.
    pub async fn shutdown(&self) {
        self.stop_session().await;
        if let Some(proxy) = &self.proxy {
            proxy.shutdown().await;
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.sessions.dispose();
        if let Some(consumer) = lock(&self.consumer).take() {
            consumer.abort();
        }
    }
}

/// Waits for a consumer task. It ends by itself once its session has
/// closed and the sink is dropped.
async fn join_consumer(consumer: JoinHandle<()>) {
    if let Err(err) = consumer.await
        && !err.is_cancelled()
    {
        warn!("session consumer failed: {err}");
    }
}

/// Builds the chat factory for the configured backend, talking to the
/// local proxy.
fn backend_factory(config: &Config, proxy_url: &Url, api_key: String) -> ChatFactory {
    let base_url = proxy_url.as_str().trim_end_matches('/').to_string();
    let agent = config.agent.clone();
    let key_header = config.proxy.api_key_header.clone();

    Arc::new(move |messages: mpsc::Receiver<String>, cancel: CancellationToken| {
        let backend = match agent.backend {
            BackendKind::Messages => AgentBackend::Messages(MessagesBackend::new(MessagesConfig {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                api_key_header: key_header.clone(),
                model: agent.model.clone(),
                max_tokens: agent.max_tokens,
                system_prompt: agent.effective_system_prompt().map(str::to_string),
            })),
            BackendKind::ClaudeCli => AgentBackend::ClaudeCli(ClaudeCliBackend::new(ClaudeCliConfig {
                program: agent.effective_cli_path(),
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                model: Some(agent.model.clone()),
                system_prompt: agent.effective_system_prompt().map(str::to_string),
                working_dir: None,
            })),
        };
        info!(backend = backend.name(), "starting agent");
        adbrief_providers::agent::chat(backend, messages, cancel)
    })
}

/// Folds session events into messages until the session ends.
async fn consume(mut events: mpsc::Receiver<SessionEvent>, shared: Arc<Shared>) {
    let mut accumulator = SegmentAccumulator::new();

    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        let ends_turn = event.ends_turn();
        let run_id = match &event {
            SessionEvent::Event { data } => {
                accumulator.apply(data);
                None
            }
            SessionEvent::TurnCompleted { run_id } => run_id.clone(),
            _ => None,
        };

        shared.broadcast(UiEvent::Session(event));
        if ends_turn {
            shared.finalize(&mut accumulator, run_id);
        }
        if terminal {
            return;
        }
    }

    // Sink dropped without a terminal event (session disposed).
    shared.finalize(&mut accumulator, None);
}

impl Shared {
    fn broadcast(&self, event: UiEvent) {
        let event = Arc::new(event);
        lock(&self.subscribers).retain(|tx| match tx.try_send(Arc::clone(&event)) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn finalize(&self, accumulator: &mut SegmentAccumulator, run_id: Option<String>) {
        let Some(message) = accumulator.finalize(run_id) else {
            return;
        };
        lock(&self.history).push(message.clone());

        let applied = apply_skill_output(&self.skills, self.store.as_ref(), &message.content);
        self.broadcast(UiEvent::MessageFinalized(message));
        match applied {
            Ok(Some(applied)) => self.broadcast(UiEvent::SkillApplied {
                skill: applied.skill.payload.skill_name().to_string(),
                report: applied.report,
            }),
            Ok(None) => {}
            Err(err) => warn!("failed to merge skill output: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use adbrief_types::{Segment, StreamEvent, ToolStatus};
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::documents::{MemoryDocumentStore, SkipReason};

    /// Replies to every message with the scripted events, then a completed
    /// turn. Ends with `done` on cancel or when the channel closes.
    fn scripted(reply: Vec<StreamEvent>) -> ChatFactory {
        Arc::new(move |messages: mpsc::Receiver<String>, cancel: CancellationToken| {
            let reply = reply.clone();
            futures_util::stream::unfold(
                (messages, cancel, Vec::<SessionEvent>::new(), false),
                move |(mut messages, cancel, mut pending, finished)| {
                    let reply = reply.clone();
                    async move {
                        if finished {
                            return None;
                        }
                        if !pending.is_empty() {
                            let next = pending.remove(0);
                            return Some((next, (messages, cancel, pending, false)));
                        }
                        tokio::select! {
                            () = cancel.cancelled() => {
                                Some((SessionEvent::Done, (messages, cancel, pending, true)))
                            }
                            next = messages.recv() => match next {
                                Some(_) => {
                                    pending = reply.iter().cloned().map(SessionEvent::event).collect();
                                    pending.push(SessionEvent::TurnCompleted { run_id: Some("run-1".to_string()) });
                                    let first = pending.remove(0);
                                    Some((first, (messages, cancel, pending, false)))
                                }
                                None => Some((SessionEvent::Done, (messages, cancel, pending, true))),
                            },
                        }
                    }
                },
            )
            .boxed()
        })
    }

    fn orchestrator(chat: ChatFactory, store: Arc<dyn DocumentStore>) -> Orchestrator {
        Orchestrator::new(OrchestratorParts {
            chat,
            store,
            skills: SkillRegistry::builtin(),
            stall_timeout: Duration::from_secs(5),
            channel_capacity: 64,
        })
    }

    async fn next_finalized(sub: &mut Subscription) -> FinalizedMessage {
        while let Some(event) = sub.recv().await {
            if let UiEvent::MessageFinalized(message) = event.as_ref() {
                return message.clone();
            }
        }
        panic!("subscription closed before a message was finalized");
    }

    #[tokio::test]
    async fn turn_is_finalized_into_history() {
        let orch = orchestrator(
            scripted(vec![StreamEvent::content("Hello"), StreamEvent::content(" world")]),
            Arc::new(MemoryDocumentStore::new()),
        );
        let mut sub = orch.subscribe();

        orch.start_session().await.unwrap();
        orch.send_message("  hi  ").await.unwrap();

        let message = next_finalized(&mut sub).await;
        assert_eq!(message.content, "Hello world");
        assert_eq!(message.run_id.as_deref(), Some("run-1"));
        assert_eq!(orch.history().len(), 1);
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let orch = orchestrator(scripted(Vec::new()), Arc::new(MemoryDocumentStore::new()));
        orch.start_session().await.unwrap();
        assert!(orch.send_message("   ").await.is_err());
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let orch = orchestrator(scripted(Vec::new()), Arc::new(MemoryDocumentStore::new()));
        let err = orch.send_message("hi").await.unwrap_err();
        assert!(err.to_string().contains("No active session"));
    }

    #[tokio::test]
    async fn skill_output_is_merged_around_user_edits() {
        let store = Arc::new(MemoryDocumentStore::new());
        let reply = "Draft:\n```campaign-brief\n{\"campaignName\": \"Launch\", \"objective\": \"Trial\", \"targetAudience\": \"Students\"}\n```";
        let orch = orchestrator(
            scripted(vec![StreamEvent::content(reply)]),
            Arc::clone(&store) as Arc<dyn DocumentStore>,
        );
        orch.edit_field("brief", "objective", json!("Awareness"))
            .unwrap();
        let mut sub = orch.subscribe();

        orch.start_session().await.unwrap();
        orch.send_message("write the brief").await.unwrap();

        let report = loop {
            let event = sub.recv().await.unwrap();
            if let UiEvent::SkillApplied { skill, report } = event.as_ref() {
                assert_eq!(skill, "campaign-brief");
                break report.clone();
            }
        };
        let brief = report.section("brief").unwrap();
        assert_eq!(brief.skipped.len(), 1);
        assert_eq!(brief.skipped[0].reason, SkipReason::UserEdited);

        let section = orch.section("brief").unwrap();
        assert_eq!(section.get("objective"), Some(&json!("Awareness")));
        assert_eq!(section.get("campaignName"), Some(&json!("Launch")));
    }

    #[tokio::test]
    async fn stop_interrupts_running_tool_call_and_keeps_content() {
        let orch = orchestrator(
            Arc::new(|_messages: mpsc::Receiver<String>, cancel: CancellationToken| {
                futures_util::stream::iter(vec![
                    SessionEvent::event(StreamEvent::content("Looking up")),
                    SessionEvent::event(StreamEvent::tool_call(
                        Some("t1".to_string()),
                        "Skill",
                        json!({}),
                    )),
                ])
                .chain(futures_util::stream::once(async move {
                    cancel.cancelled().await;
                    SessionEvent::Done
                }))
                .boxed()
            }),
            Arc::new(MemoryDocumentStore::new()),
        );
        let mut sub = orch.subscribe();
        orch.start_session().await.unwrap();

        // Wait until the tool call has been forwarded.
        loop {
            let event = sub.recv().await.unwrap();
            if matches!(
                event.as_ref(),
                UiEvent::Session(SessionEvent::Event {
                    data: StreamEvent::ToolCall { .. }
                })
            ) {
                break;
            }
        }
        orch.stop_session().await;

        let history = orch.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Looking up");
        let call = history[0].tool_calls().next().unwrap();
        assert_eq!(call.status, ToolStatus::Interrupted);
        assert!(matches!(history[0].segments[0], Segment::Content { .. }));
        assert!(!orch.has_session());

        // Idempotent.
        orch.stop_session().await;
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let orch = orchestrator(
            scripted(vec![StreamEvent::content("x")]),
            Arc::new(MemoryDocumentStore::new()),
        );
        drop(orch.subscribe());
        let mut kept = orch.subscribe();

        orch.start_session().await.unwrap();
        orch.send_message("go").await.unwrap();
        next_finalized(&mut kept).await;

        assert_eq!(lock(&orch.shared.subscribers).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_keeps_the_previous_sessions_last_message() {
        let reply = "Done:\n```campaign-brief\n{\"campaignName\": \"Launch\", \"objective\": \"Trial\", \"targetAudience\": \"Students\"}\n```";
        let sessions = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            Arc::new(move |_messages: mpsc::Receiver<String>, _cancel: CancellationToken| -> SessionStream {
                if sessions.fetch_add(1, Ordering::SeqCst) > 0 {
                    return futures_util::stream::pending().boxed();
                }
                let mut events: Vec<SessionEvent> = (0..200)
                    .map(|_| SessionEvent::event(StreamEvent::content("")))
                    .collect();
                events.push(SessionEvent::event(StreamEvent::content(reply)));
                events.push(SessionEvent::Done);
                futures_util::stream::iter(events).boxed()
            }),
            Arc::new(MemoryDocumentStore::new()),
        );

        orch.start_session().await.unwrap();
        while orch.has_session() {
            tokio::task::yield_now().await;
        }
        orch.start_session().await.unwrap();

        let history = orch.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].content.contains("campaign-brief"));
        assert_eq!(
            orch.section("brief").unwrap().get("campaignName"),
            Some(&json!("Launch"))
        );
    }

    #[tokio::test]
    async fn section_lock_round_trips() {
        let orch = orchestrator(scripted(Vec::new()), Arc::new(MemoryDocumentStore::new()));
        orch.set_section_locked("audience", true).unwrap();
        assert!(orch.section("audience").unwrap().locked);
        orch.set_section_locked("audience", false).unwrap();
        assert!(!orch.section("audience").unwrap().locked);
    }
}
