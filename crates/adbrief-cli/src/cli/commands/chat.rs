//! Chat command handler.
//!
//! Reads one message per stdin line. Lines starting with `/` are commands:
//! `/stop` interrupts the agent, `/quit` exits, `/doc <section>` prints a
//! document section. Ctrl+C interrupts a running turn, or exits when idle.

use adbrief_core::config::{Config, paths};
use adbrief_core::{Orchestrator, logging};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::render::{ChatRenderer, TurnSignal};

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Stop,
    Doc(Option<&'a str>),
    Unknown(&'a str),
    Message(&'a str),
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Message(line);
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (command, None),
        };
        match name {
            "quit" | "exit" => Input::Quit,
            "stop" => Input::Stop,
            "doc" => Input::Doc(arg),
            _ => Input::Unknown(name),
        }
    }
}

pub async fn run(config: &Config) -> Result<()> {
    let _log_guard = logging::init(&paths::logs_dir())?;

    let orchestrator = Orchestrator::from_config(config).await?;
    let mut subscription = orchestrator.subscribe();
    let started = orchestrator.start_session().await?;
    tracing::info!(session_id = %started.session_id, "chat started");
    eprintln!("Session started. /stop interrupts, /doc <section> shows a document, /quit exits.");

    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(async move {
        let mut renderer = ChatRenderer::new();
        while let Some(event) = subscription.recv().await {
            let signal = renderer.handle_event(&event);
            if signal != TurnSignal::None && signal_tx.send(signal).is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_turns = 0usize;
    let mut input_open = true;

    loop {
        if !input_open && pending_turns == 0 {
            break;
        }
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line.context("read stdin")? else {
                    input_open = false;
                    continue;
                };
                match Input::parse(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Stop => {
                        orchestrator.stop_session().await;
                        pending_turns = 0;
                        eprintln!("Interrupted.");
                    }
                    Input::Doc(section) => print_section(&orchestrator, section),
                    Input::Unknown(name) => eprintln!("Unknown command: /{name}"),
                    Input::Message(text) => {
                        if !orchestrator.has_session() {
                            orchestrator.start_session().await?;
                        }
                        match orchestrator.send_message(text).await {
                            Ok(()) => pending_turns += 1,
                            Err(err) => eprintln!("Error: {err}"),
                        }
                    }
                }
            }
            signal = signals.recv() => match signal {
                Some(TurnSignal::TurnEnded) => pending_turns = pending_turns.saturating_sub(1),
                Some(_) => pending_turns = 0,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if pending_turns == 0 {
                    break;
                }
                orchestrator.stop_session().await;
                pending_turns = 0;
                eprintln!("Interrupted.");
            }
        }
    }

    orchestrator.shutdown().await;
    drop(orchestrator);
    let _ = renderer.await;
    Ok(())
}

fn print_section(orchestrator: &Orchestrator, section: Option<&str>) {
    let Some(name) = section else {
        eprintln!("Usage: /doc <section>");
        return;
    };
    match orchestrator.section(name) {
        Some(section) => match serde_json::to_string_pretty(&section) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("Error: {err}"),
        },
        None => eprintln!("No section named '{name}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Input::parse("/quit"), Input::Quit);
        assert_eq!(Input::parse("  /stop "), Input::Stop);
        assert_eq!(Input::parse("/doc brief"), Input::Doc(Some("brief")));
        assert_eq!(Input::parse("/doc"), Input::Doc(None));
        assert_eq!(Input::parse("/nope"), Input::Unknown("nope"));
    }

    #[test]
    fn plain_lines_are_trimmed_messages() {
        assert_eq!(Input::parse("  draft a brief  "), Input::Message("draft a brief"));
        assert_eq!(Input::parse("   "), Input::Empty);
    }
}
