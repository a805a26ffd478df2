//! Streamed stdout/stderr rendering of orchestrator events.
//!
//! # Output contract
//! - assistant content -> stdout
//! - thinking, tool activity, skill merges and errors -> stderr

use std::io::{Stderr, Stdout, Write, stderr, stdout};

use adbrief_core::UiEvent;
use adbrief_core::skills::MergeReport;
use adbrief_types::{SessionEvent, StreamEvent};

/// What an event means for the input loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    None,
    TurnEnded,
    SessionEnded,
}

pub struct ChatRenderer<O: Write = Stdout, E: Write = Stderr> {
    stdout: O,
    stderr: E,
    /// Assistant text was printed without a trailing newline.
    needs_final_newline: bool,
    thinking: bool,
}

impl Default for ChatRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRenderer {
    pub fn new() -> Self {
        Self::with_writers(stdout(), stderr())
    }
}

impl<O: Write, E: Write> ChatRenderer<O, E> {
    pub fn with_writers(stdout: O, stderr: E) -> Self {
        Self {
            stdout,
            stderr,
            needs_final_newline: false,
            thinking: false,
        }
    }

    pub fn handle_event(&mut self, event: &UiEvent) -> TurnSignal {
        match event {
            UiEvent::Session(event) => self.handle_session_event(event),
            UiEvent::MessageFinalized(_) => TurnSignal::None,
            UiEvent::SkillApplied { skill, report } => {
                self.skill_applied(skill, report);
                TurnSignal::None
            }
        }
    }

    fn handle_session_event(&mut self, event: &SessionEvent) -> TurnSignal {
        match event {
            SessionEvent::Metadata { model, .. } => {
                if let Some(model) = model {
                    let _ = writeln!(self.stderr, "[model: {model}]");
                }
                TurnSignal::None
            }
            SessionEvent::Event { data } => {
                self.stream_event(data);
                TurnSignal::None
            }
            SessionEvent::TurnCompleted { .. } => {
                self.end_line();
                TurnSignal::TurnEnded
            }
            SessionEvent::Done => {
                self.end_line();
                TurnSignal::SessionEnded
            }
            SessionEvent::Error { message } => {
                self.end_line();
                let _ = writeln!(self.stderr, "Error: {message}");
                TurnSignal::SessionEnded
            }
        }
    }

    fn stream_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content { text } => {
                if text.is_empty() {
                    return;
                }
                self.thinking = false;
                let _ = write!(self.stdout, "{text}");
                let _ = self.stdout.flush();
                self.needs_final_newline = true;
            }
            StreamEvent::ThinkingStart => self.thinking = false,
            StreamEvent::Thinking { text } => {
                if !self.thinking && !text.is_empty() {
                    self.thinking = true;
                    let _ = writeln!(self.stderr, "(thinking...)");
                }
            }
            StreamEvent::ToolCall { name, .. } => {
                self.end_line();
                let _ = writeln!(self.stderr, "Tool requested: {name}");
            }
            StreamEvent::ToolResult { id, is_error, .. } => {
                let id = id.as_deref().unwrap_or("?");
                let outcome = if *is_error { "failed" } else { "finished" };
                let _ = writeln!(self.stderr, "Tool {outcome} ({id})");
            }
        }
    }

    fn skill_applied(&mut self, skill: &str, report: &MergeReport) {
        for section in &report.sections {
            let _ = write!(
                self.stderr,
                "Applied {skill} to '{}': {} written",
                section.section,
                section.written.len()
            );
            if !section.skipped.is_empty() {
                let skipped: Vec<&str> = section.skipped.iter().map(|s| s.field.as_str()).collect();
                let _ = write!(self.stderr, ", skipped {}", skipped.join(", "));
            }
            let _ = writeln!(self.stderr);
        }
    }

    fn end_line(&mut self) {
        if self.needs_final_newline {
            let _ = writeln!(self.stdout);
            let _ = self.stdout.flush();
            self.needs_final_newline = false;
        }
    }
}
