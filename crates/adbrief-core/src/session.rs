//! Session lifecycle: one long-lived, interruptible agent conversation.
//!
//! State machine: `idle -> active -> interrupting -> closed`, or
//! `active -> closed` when the agent stream ends on its own or a turn runs
//! past the stall timeout without producing an event.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adbrief_providers::agent::SessionStream;
use adbrief_types::SessionEvent;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MESSAGE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Interrupting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A non-closed session already exists (carries its id).
    AlreadyActive(String),
    NoActiveSession,
    /// The agent stopped reading messages.
    ChannelClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive(id) => write!(f, "Session {id} is already active"),
            SessionError::NoActiveSession => write!(f, "No active session. Start one first."),
            SessionError::ChannelClosed => write!(f, "The agent is no longer accepting messages"),
        }
    }
}

impl std::error::Error for SessionError {}

struct Slot {
    generation: u64,
    id: String,
    status: SessionStatus,
    messages: Option<mpsc::Sender<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    sink: Option<mpsc::Sender<SessionEvent>>,
    /// Turns pushed and not yet completed.
    turns: Arc<watch::Sender<usize>>,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    slot: Option<Slot>,
    next_generation: u64,
}

impl Inner {
    fn close(&mut self, generation: u64) {
        if let Some(slot) = self.slot.as_mut()
            && slot.generation == generation
        {
            slot.status = SessionStatus::Closed;
            slot.messages = None;
            slot.sink = None;
        }
    }
}

/// Owns at most one non-closed session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<Inner>>,
    stall_timeout: Duration,
}

impl SessionManager {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::default(),
            stall_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a message channel, starts `chat_fn` on it and forwards every
    /// event it yields to `sink` from a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `SessionError::AlreadyActive` if a non-closed session exists.
    pub fn create_session<F>(
        &self,
        id: impl Into<String>,
        sink: mpsc::Sender<SessionEvent>,
        chat_fn: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(mpsc::Receiver<String>, CancellationToken) -> SessionStream,
    {
        let id = id.into();
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let cancel = CancellationToken::new();
        let turns = Arc::new(watch::channel(0usize).0);

        let generation = {
            let mut inner = self.lock();
            if let Some(slot) = &inner.slot
                && slot.status != SessionStatus::Closed
            {
                return Err(SessionError::AlreadyActive(slot.id.clone()));
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.slot = Some(Slot {
                generation,
                id: id.clone(),
                status: SessionStatus::Idle,
                messages: Some(messages_tx),
                cancel: cancel.clone(),
                task: None,
                sink: Some(sink.clone()),
                turns: Arc::clone(&turns),
                started_at: Utc::now(),
            });
            generation
        };

        let stream = chat_fn(messages_rx, cancel.clone());

        let mut inner = self.lock();
        let Some(slot) = inner
            .slot
            .as_mut()
            .filter(|slot| slot.generation == generation)
        else {
            // Disposed while the stream was being built.
            cancel.cancel();
            return Ok(());
        };
        slot.task = Some(tokio::spawn(forward(
            stream,
            sink,
            cancel,
            Arc::clone(&self.inner),
            generation,
            turns,
            self.stall_timeout,
        )));
        slot.status = SessionStatus::Active;
        info!(session_id = %id, "session started");
        Ok(())
    }

    /// Enqueues a user message for the active session.
    ///
    /// # Errors
    /// Returns `SessionError::NoActiveSession` when no session is active and
    /// `SessionError::ChannelClosed` when the agent stopped reading.
    pub async fn push_message(&self, content: impl Into<String>) -> Result<(), SessionError> {
        let (sender, turns) = {
            let inner = self.lock();
            match &inner.slot {
                Some(slot) if slot.status == SessionStatus::Active => slot
                    .messages
                    .clone()
                    .map(|sender| (sender, Arc::clone(&slot.turns))),
                _ => None,
            }
        }
        .ok_or(SessionError::NoActiveSession)?;

        turns.send_modify(|n| *n += 1);
        if sender.send(content.into()).await.is_err() {
            turns.send_modify(|n| *n = n.saturating_sub(1));
            return Err(SessionError::ChannelClosed);
        }
        Ok(())
    }

    /// Cancels the active session and waits for its terminal event.
    ///
    /// If the agent does not stop within the stall timeout the task is
    /// aborted and a synthetic error is sent to the sink. The session is
    /// closed either way.
    ///
    /// # Errors
    /// Returns `SessionError::NoActiveSession` when no session is active.
    pub async fn interrupt_session(&self) -> Result<(), SessionError> {
        let (cancel, task, sink, generation, id) = {
            let mut inner = self.lock();
            let Some(slot) = inner
                .slot
                .as_mut()
                .filter(|slot| slot.status == SessionStatus::Active)
            else {
                return Err(SessionError::NoActiveSession);
            };
            slot.status = SessionStatus::Interrupting;
            (
                slot.cancel.clone(),
                slot.task.take(),
                slot.sink.clone(),
                slot.generation,
                slot.id.clone(),
            )
        };

        debug!(session_id = %id, "interrupting session");
        cancel.cancel();

        if let Some(mut task) = task
            && tokio::time::timeout(self.stall_timeout, &mut task)
                .await
                .is_err()
        {
            warn!(
                session_id = %id,
                timeout_secs = self.stall_timeout.as_secs(),
                "agent did not stop after interrupt, aborting"
            );
            task.abort();
            if let Some(sink) = sink {
                let _ = sink
                    .send(SessionEvent::error(format!(
                        "The agent did not stop within {}s and was terminated.",
                        self.stall_timeout.as_secs()
                    )))
                    .await;
            }
        }

        self.lock().close(generation);
        info!(session_id = %id, "session interrupted");
        Ok(())
    }

    pub fn has_session(&self) -> bool {
        self.lock()
            .slot
            .as_ref()
            .is_some_and(|slot| slot.status != SessionStatus::Closed)
    }

    /// Drops the session without waiting for it to stop.
    pub fn dispose(&self) {
        let slot = self.lock().slot.take();
        if let Some(slot) = slot {
            debug!(session_id = %slot.id, "disposing session");
            slot.cancel.cancel();
            if let Some(task) = slot.task {
                task.abort();
            }
        }
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.lock().slot.as_ref().map(|slot| slot.status)
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().slot.as_ref().map(|slot| slot.id.clone())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().slot.as_ref().map(|slot| slot.started_at)
    }
}

/// Forwards agent events to the sink until a terminal event.
///
/// After cancellation only terminal events pass. A stream that ends without
/// one gets a trailing `done`. While a turn is in flight, going
/// `stall_timeout` without an event cancels the agent and ends the session
/// with an error.
async fn forward(
    mut stream: SessionStream,
    sink: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    turns: Arc<watch::Sender<usize>>,
    stall_timeout: Duration,
) {
    let mut in_flight = turns.subscribe();
    let mut terminated = false;
    loop {
        let waiting = *in_flight.borrow_and_update() > 0 && !cancel.is_cancelled();
        let next = if waiting {
            if let Ok(next) = tokio::time::timeout(stall_timeout, stream.next()).await {
                next
            } else {
                warn!(
                    timeout_secs = stall_timeout.as_secs(),
                    "agent stalled mid-turn, closing session"
                );
                cancel.cancel();
                let _ = sink
                    .send(SessionEvent::error(format!(
                        "The agent did not respond within {}s and was terminated.",
                        stall_timeout.as_secs()
                    )))
                    .await;
                terminated = true;
                break;
            }
        } else {
            tokio::select! {
                next = stream.next() => next,
                Ok(()) = in_flight.changed() => continue,
            }
        };
        let Some(event) = next else {
            break;
        };

        if matches!(event, SessionEvent::TurnCompleted { .. }) {
            turns.send_modify(|n| *n = n.saturating_sub(1));
        }
        let terminal = event.is_terminal();
        if cancel.is_cancelled() && !terminal {
            continue;
        }
        if sink.send(event).await.is_err() {
            debug!("session sink closed, stopping forwarder");
            terminated = true;
            break;
        }
        if terminal {
            terminated = true;
            break;
        }
    }
    if !terminated {
        let _ = sink.send(SessionEvent::Done).await;
    }

    inner
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close(generation);
}
