//! Orchestration core for adbrief: session lifecycle, stream accumulation,
//! skill extraction and lock-aware document merges.

pub mod config;
pub mod documents;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod skills;
pub mod stream;

pub use config::Config;
pub use orchestrator::{Orchestrator, SessionStarted, Subscription, UiEvent};
pub use session::{SessionError, SessionManager, SessionStatus};
