//! Error types shared by the proxy and the agent backends.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for adbrief API requests.
pub const USER_AGENT: &str = concat!("adbrief/", env!("CARGO_PKG_VERSION"));

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection failure or request timeout
    Timeout,
    /// Failed to parse response (JSON parse error, invalid SSE, etc.)
    Parse,
    /// API-level error returned mid-stream (e.g., overloaded)
    ApiError,
    /// The agent subprocess could not be spawned or exited early
    Process,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
            ProviderErrorKind::Process => write!(f, "process"),
        }
    }
}

/// Structured error from an agent backend with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
    /// HTTP status, when the error came from a response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            status: None,
        }
    }

    /// Creates an HTTP status error, pulling `error.message` out of a JSON body.
    pub fn http_status(status: u16, body: &str) -> Self {
        let details = (!body.is_empty()).then(|| body.to_string());
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| {
                json.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(|msg| format!("HTTP {status}: {msg}"))
            })
            .unwrap_or_else(|| format!("HTTP {status}"));

        Self {
            kind: ProviderErrorKind::HttpStatus,
            message,
            details,
            status: Some(status),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Parse, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Process, message)
    }

    /// Creates an API error (from a mid-stream error event).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(
            ProviderErrorKind::ApiError,
            format!("{error_type}: {message}"),
        )
    }

    /// Message shown to the user, with a remediation hint where one exists.
    pub fn user_message(&self) -> String {
        match (&self.kind, self.status) {
            (ProviderErrorKind::HttpStatus, Some(401 | 403)) => format!(
                "{}. No valid API key configured. Set ANTHROPIC_API_KEY or api_key in [proxy] in the settings file.",
                self.message
            ),
            (ProviderErrorKind::HttpStatus, Some(429)) => {
                format!("{}. Rate limited; wait a moment and retry.", self.message)
            }
            (ProviderErrorKind::HttpStatus, Some(502)) => format!(
                "{}. The local proxy could not reach the model API; check upstream_url in [proxy] and your network.",
                self.message
            ),
            (ProviderErrorKind::Timeout, _) => format!(
                "{}. Check your network connection and upstream_url in [proxy].",
                self.message
            ),
            (ProviderErrorKind::Process, _) => format!(
                "{}. Check cli_path in [agent] or switch backend to \"messages\".",
                self.message
            ),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Maps a reqwest failure onto a provider error kind.
pub(crate) fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}
