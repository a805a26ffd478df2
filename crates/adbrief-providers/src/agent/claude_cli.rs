//! Claude CLI backend: a long-lived `claude` process speaking stream-json.
//!
//! The process is spawned on the first turn with `ANTHROPIC_BASE_URL`
//! pointing at the local proxy. Each user message is written to stdin as
//! one JSON line; stdout lines are mapped to turn events until a `result`
//! line closes the turn.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use adbrief_types::StreamEvent;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::mapper::EventMapper;
use super::sse::parse_event_fields;
use super::{TurnEvent, TurnOutcome, TurnSender};
use crate::shared::{ProviderError, ProviderResult};

/// Configuration for the Claude CLI backend.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    /// Executable to run (default `claude`).
    pub program: PathBuf,
    /// Exported as `ANTHROPIC_BASE_URL` (normally the local proxy).
    pub base_url: String,
    /// Exported as `ANTHROPIC_API_KEY`.
    pub api_key: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
}

struct CliProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct ClaudeCliBackend {
    config: ClaudeCliConfig,
    process: Option<CliProcess>,
}

impl ClaudeCliBackend {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    pub(crate) async fn run_turn(
        &mut self,
        prompt: String,
        tx: &TurnSender,
        cancel: &CancellationToken,
    ) -> ProviderResult<TurnOutcome> {
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(ProviderError::process("Claude CLI process is not running"));
        };

        let result = drive_turn(process, &prompt, tx, cancel).await;
        if result.is_err() || cancel.is_cancelled() {
            // Dropping the handle kills the child.
            self.process = None;
        }
        result
    }

    fn spawn(&self) -> ProviderResult<CliProcess> {
        let program = &self.config.program;
        let mut command = Command::new(program);
        command
            .args(build_args(&self.config))
            .env("ANTHROPIC_BASE_URL", &self.config.base_url)
            .env("ANTHROPIC_API_KEY", &self.config.api_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ProviderError::process(format!("Failed to start {}: {e}", program.display()))
        })?;
        info!(program = %program.display(), "spawned Claude CLI");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::process("Claude CLI stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::process("Claude CLI stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "adbrief::claude_cli", "{line}");
                }
            });
        }

        Ok(CliProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

async fn drive_turn(
    process: &mut CliProcess,
    prompt: &str,
    tx: &TurnSender,
    cancel: &CancellationToken,
) -> ProviderResult<TurnOutcome> {
    let mut line = user_message_line(prompt);
    line.push('\n');
    let write = async {
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await
    };
    write
        .await
        .map_err(|e| ProviderError::process(format!("Failed to write to Claude CLI: {e}")))?;

    let mut turn = CliTurn::default();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(TurnOutcome::default()),
            next = process.stdout.next_line() => next,
        };
        match next {
            Ok(Some(line)) => match turn.apply_line(&line)? {
                LineOutcome::Events(events) => {
                    for event in events {
                        tx.send(event).await;
                    }
                }
                LineOutcome::Finished(outcome) => return Ok(outcome),
            },
            Ok(None) => {
                let status = process.child.wait().await.ok();
                let code = status.and_then(|s| s.code()).unwrap_or(-1);
                return Err(ProviderError::process(format!(
                    "Claude CLI exited with code {code} before finishing the turn"
                )));
            }
            Err(e) => {
                return Err(ProviderError::process(format!(
                    "Failed to read Claude CLI output: {e}"
                )));
            }
        }
    }
}

fn build_args(config: &ClaudeCliConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--print",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    if let Some(model) = normalize_optional(config.model.as_deref()) {
        args.push(OsString::from("--model"));
        args.push(OsString::from(model));
    }
    if let Some(prompt) = normalize_optional(config.system_prompt.as_deref()) {
        args.push(OsString::from("--append-system-prompt"));
        args.push(OsString::from(prompt));
    }
    args
}

fn normalize_optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn user_message_line(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}]
        }
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    StreamEvent {
        event: Value,
    },
    Assistant {
        message: CliMessage,
    },
    User {
        message: CliMessage,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        uuid: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliMessage {
    #[serde(default)]
    content: Value,
}

impl CliMessage {
    /// Content blocks; plain-string content carries none.
    fn blocks(self) -> Vec<CliBlock> {
        match self.content {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, PartialEq)]
enum LineOutcome {
    Events(Vec<TurnEvent>),
    Finished(TurnOutcome),
}

/// Mapping state for one turn of stream-json output.
#[derive(Debug, Default)]
struct CliTurn {
    mapper: EventMapper,
    saw_stream_events: bool,
}

impl CliTurn {
    fn apply_line(&mut self, line: &str) -> ProviderResult<LineOutcome> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(LineOutcome::Events(Vec::new()));
        }
        let parsed: CliLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("skipping unparseable Claude CLI line: {err}");
                return Ok(LineOutcome::Events(Vec::new()));
            }
        };

        let events = match parsed {
            CliLine::System {
                subtype,
                session_id,
                model,
            } if subtype.as_deref() == Some("init") => {
                vec![TurnEvent::Metadata { session_id, model }]
            }
            CliLine::StreamEvent { event } => self.apply_stream_event(&event)?,
            CliLine::Assistant { message } if !self.saw_stream_events => message
                .blocks()
                .into_iter()
                .flat_map(assistant_block_events)
                .collect(),
            CliLine::User { message } => message
                .blocks()
                .into_iter()
                .filter_map(|block| match block {
                    CliBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(TurnEvent::Stream(StreamEvent::tool_result(
                        tool_use_id,
                        content,
                        is_error,
                    ))),
                    _ => None,
                })
                .collect(),
            CliLine::Result {
                subtype,
                is_error,
                result,
                session_id,
                uuid,
            } => {
                let subtype = subtype.unwrap_or_else(|| "success".to_string());
                if is_error || subtype != "success" {
                    let message = result.unwrap_or_else(|| "agent run failed".to_string());
                    return Err(ProviderError::api_error(&subtype, &message));
                }
                return Ok(LineOutcome::Finished(TurnOutcome {
                    run_id: uuid.or(session_id),
                }));
            }
            _ => Vec::new(),
        };
        Ok(LineOutcome::Events(events))
    }

    fn apply_stream_event(&mut self, event: &Value) -> ProviderResult<Vec<TurnEvent>> {
        self.saw_stream_events = true;
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let parsed = match parse_event_fields(event_type, &event.to_string()) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("skipping Claude CLI stream event: {err}");
                return Ok(Vec::new());
            }
        };
        // Session metadata comes from the `system` init line instead.
        Ok(self
            .mapper
            .apply(parsed)?
            .filter(|e| !matches!(e, TurnEvent::Metadata { .. }))
            .into_iter()
            .collect())
    }
}

fn assistant_block_events(block: CliBlock) -> Vec<TurnEvent> {
    match block {
        CliBlock::Text { text } if !text.is_empty() => {
            vec![TurnEvent::Stream(StreamEvent::content(text))]
        }
        CliBlock::Thinking { thinking } => vec![
            TurnEvent::Stream(StreamEvent::ThinkingStart),
            TurnEvent::Stream(StreamEvent::thinking(thinking)),
        ],
        CliBlock::ToolUse { id, name, input } => {
            vec![TurnEvent::Stream(StreamEvent::tool_call(id, name, input))]
        }
        _ => Vec::new(),
    }
}
