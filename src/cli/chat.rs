//! Line-oriented interactive chat.
//!
//! Lines typed on stdin are submitted as turns; replies are printed from
//! transcript events as fragments arrive. Input is gated while a reply is
//! being generated, except for `/stop`, `/help` and `/quit`.

use std::error::Error;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::cli::build_controller;
use crate::core::config::Config;
use crate::core::message::{Message, TranscriptRole};
use crate::core::transcript::{Transcript, TranscriptEvent};
use crate::core::turn::{Locale, TurnController, TurnOutcome, ValidationError};
use crate::utils::logging::LoggingState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    New,
    Stop,
    Log(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

/// Parse a slash command; `None` means the line is a message.
pub fn parse_command(line: &str) -> Option<ChatCommand> {
    let rest = line.trim().strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|arg| !arg.is_empty())),
        None => (rest, None),
    };
    let command = match name.to_ascii_lowercase().as_str() {
        "new" => ChatCommand::New,
        "stop" => ChatCommand::Stop,
        "log" => ChatCommand::Log(arg.map(str::to_string)),
        "help" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        _ => ChatCommand::Unknown(name.to_string()),
    };
    Some(command)
}

/// Empty-state greeting and suggested prompts.
pub fn greeting(locale: Locale) -> (&'static str, &'static [&'static str]) {
    match locale {
        Locale::Fr => (
            "Bonjour ! Comment puis-je vous aider ?",
            &[
                "Explique l'informatique quantique",
                "Idées de cadeaux pour un chef",
                "Planifie un voyage à Paris",
                "Code un jeu Snake en Python",
            ],
        ),
        Locale::En => (
            "Hello! How can I help you?",
            &[
                "Explain quantum computing",
                "Gift ideas for a chef",
                "Plan a trip to Paris",
                "Write a Snake game in Python",
            ],
        ),
    }
}

fn print_greeting(locale: Locale) {
    let (title, hints) = greeting(locale);
    println!("{title}");
    for hint in hints {
        println!("  « {hint} »");
    }
    println!();
}

const HELP: &str = "Commands:\n  \
/new              Start a new conversation\n  \
/stop             Cancel the reply being generated\n  \
/log <filename>   Enable logging to specified file\n  \
/log              Toggle logging pause/resume\n  \
/help             Show this list\n  \
/quit             Leave the chat";

pub async fn run_chat(config: &Config, log_file: Option<String>) -> Result<(), Box<dyn Error>> {
    let controller = Arc::new(build_controller(config));
    let logging = Arc::new(Mutex::new(LoggingState::new(log_file)?));
    let printer = spawn_printer(controller.transcript().clone(), logging.clone());
    let locale = config.locale();

    eprintln!("💬 Causerie ({}), /help for commands", config.model());
    print_greeting(locale);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running: Option<JoinHandle<TurnOutcome>> = None;
    let mut quit = false;

    while let Some(line) = lines.next_line().await? {
        if let Some(command) = parse_command(&line) {
            match command {
                ChatCommand::Quit => {
                    quit = true;
                    break;
                }
                ChatCommand::Help => println!("{HELP}"),
                ChatCommand::Stop => {
                    if !controller.cancel_active_turn() {
                        eprintln!("⚠️  Nothing to stop");
                    }
                }
                ChatCommand::New => match controller.new_conversation() {
                    Ok(()) => {
                        println!();
                        print_greeting(locale);
                    }
                    Err(err) => eprintln!("⚠️  {err}; use /stop first"),
                },
                ChatCommand::Log(path) => {
                    let mut logging = logging.lock().unwrap();
                    let result = match path {
                        Some(path) => logging.set_log_file(path),
                        None => logging.toggle_logging(),
                    };
                    match result {
                        Ok(message) => eprintln!("📝 {message}"),
                        Err(err) => eprintln!("❌ {err}"),
                    }
                }
                ChatCommand::Unknown(name) => eprintln!("❌ Unknown command: /{name}"),
            }
            continue;
        }

        match controller.submit_turn(&line) {
            Ok(turn) => running = Some(tokio::spawn(turn.run())),
            Err(ValidationError::EmptyInput) => {}
            Err(err @ ValidationError::TurnActive) => {
                eprintln!("⚠️  {err}; wait for it or use /stop");
            }
        }
    }

    finish_turn(&controller, running.take(), quit).await?;
    printer.finish().await;
    Ok(())
}

/// Wait for the last turn to conclude, cancelling it first when the user quit.
pub(crate) async fn finish_turn(
    controller: &TurnController,
    running: Option<JoinHandle<TurnOutcome>>,
    quit: bool,
) -> Result<Option<TurnOutcome>, JoinError> {
    if controller.turn_active() {
        if quit {
            tracing::debug!("quitting with a turn in flight, cancelling it");
            controller.cancel_active_turn();
        } else {
            tracing::debug!("input closed with a turn in flight, waiting for it");
        }
    }
    match running {
        Some(handle) => handle.await.map(Some),
        None => Ok(None),
    }
}

/// Display task fed by transcript events.
pub(crate) struct Printer {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Printer {
    /// Stop once every event already emitted has been shown and logged.
    pub(crate) async fn finish(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "display task ended abnormally");
        }
    }
}

/// Print transcript changes as they happen and mirror sealed messages to the log file.
pub(crate) fn spawn_printer(transcript: Transcript, logging: Arc<Mutex<LoggingState>>) -> Printer {
    let mut events = transcript.subscribe();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let handle = tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                received = events.recv() => received,
                _ = stop.cancelled() => break,
            };
            match received {
                Ok(event) => show_event(&transcript, &logging, event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "display fell behind the transcript");
                }
                Err(RecvError::Closed) => return,
            }
        }
        // Drain what the last turn emitted before shutdown was requested.
        loop {
            match events.try_recv() {
                Ok(event) => show_event(&transcript, &logging, event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "display fell behind the transcript");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    });
    Printer { handle, shutdown }
}

fn show_event(transcript: &Transcript, logging: &Mutex<LoggingState>, event: TranscriptEvent) {
    let mut stdout = io::stdout();
    match event {
        TranscriptEvent::MessageAppended { id, role } => {
            if role == TranscriptRole::User {
                if let Some(message) = transcript.get(id) {
                    log_sealed(logging, &message);
                }
            } else if let Some(message) = transcript.get(id) {
                let _ = write!(stdout, "[{}] ", message.display_time());
            }
        }
        TranscriptEvent::FragmentAppended { fragment, .. } => {
            let _ = write!(stdout, "{fragment}");
        }
        TranscriptEvent::MessageFinalized { id } => {
            let _ = writeln!(stdout);
            let _ = writeln!(stdout);
            if let Some(message) = transcript.get(id) {
                log_sealed(logging, &message);
            }
        }
        TranscriptEvent::MessageFailed { id, content } => {
            let _ = writeln!(stdout);
            let _ = writeln!(stdout, "❌ {content}");
            let _ = writeln!(stdout);
            if let Some(message) = transcript.get(id) {
                log_sealed(logging, &message);
            }
        }
        TranscriptEvent::Cleared => {}
    }
    let _ = stdout.flush();
}

fn log_sealed(logging: &Mutex<LoggingState>, message: &Message) {
    if let Err(err) = logging.lock().unwrap().log_message(message) {
        tracing::warn!(error = %err, "could not write transcript log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::GenerationError;
    use crate::core::turn::{TurnSettings, TurnState};
    use crate::utils::test_utils::{fragment, ScriptItem, ScriptedClient};
    use tempfile::TempDir;

    fn log_to(path: &std::path::Path) -> Arc<Mutex<LoggingState>> {
        let logging = LoggingState::new(Some(path.display().to_string())).expect("log file");
        Arc::new(Mutex::new(logging))
    }

    #[tokio::test]
    async fn finishing_the_printer_keeps_the_last_reply() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log_path = temp_dir.path().join("chat.log");
        let client = ScriptedClient::new(vec![vec![fragment("Bon"), fragment("jour")]]);
        let controller = TurnController::new(Transcript::new(), client, TurnSettings::default());
        let printer = spawn_printer(controller.transcript().clone(), log_to(&log_path));

        let outcome = controller.send("Hello").await.expect("accepted");
        assert!(outcome.is_finalized());
        printer.finish().await;

        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("): Hello"), "user line missing: {log:?}");
        assert!(log.contains("Bonjour"), "reply missing: {log:?}");
    }

    #[tokio::test]
    async fn finishing_the_printer_keeps_a_trailing_failure() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let log_path = temp_dir.path().join("chat.log");
        let client = ScriptedClient::new(vec![vec![
            fragment("Bon"),
            ScriptItem::Fail(GenerationError::Transport("reset".to_string())),
        ]]);
        let controller = TurnController::new(Transcript::new(), client, TurnSettings::default());
        let printer = spawn_printer(controller.transcript().clone(), log_to(&log_path));

        controller.send("Hello").await.expect("accepted");
        printer.finish().await;

        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains(&controller.settings().messages.generation_failed));
    }

    #[tokio::test]
    async fn quitting_cancels_the_turn_in_flight() {
        let client = ScriptedClient::new(vec![vec![
            fragment("Bon"),
            ScriptItem::Gate,
            fragment("jour"),
        ]]);
        let controller =
            TurnController::new(Transcript::new(), client.clone(), TurnSettings::default());
        let turn = controller.submit_turn("Hello").expect("accepted");
        let mut state = controller.watch_state();
        let running = tokio::spawn(turn.run());
        state
            .wait_for(|state| *state == TurnState::Streaming)
            .await
            .expect("streaming");

        let outcome = finish_turn(&controller, Some(running), true)
            .await
            .expect("join")
            .expect("a turn was running");

        assert!(outcome.is_cancelled());
        assert!(!controller.turn_active());
        assert_eq!(client.live_streams(), 0);
    }

    #[tokio::test]
    async fn closing_input_lets_the_turn_finish() {
        let client = ScriptedClient::new(vec![vec![fragment("Bon"), fragment("jour")]]);
        let controller = TurnController::new(Transcript::new(), client, TurnSettings::default());
        let running = tokio::spawn(controller.submit_turn("Hello").expect("accepted").run());

        let outcome = finish_turn(&controller, Some(running), false)
            .await
            .expect("join")
            .expect("a turn was running");

        assert!(outcome.is_finalized());
        assert_eq!(outcome.content(), "Bonjour");
        assert!(finish_turn(&controller, None, true)
            .await
            .expect("join")
            .is_none());
    }

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(parse_command("Bonjour"), None);
        assert_eq!(parse_command("  pas /une commande"), None);
    }

    #[test]
    fn slash_commands_parse_with_arguments() {
        assert_eq!(parse_command("/new"), Some(ChatCommand::New));
        assert_eq!(parse_command(" /STOP "), Some(ChatCommand::Stop));
        assert_eq!(parse_command("/log"), Some(ChatCommand::Log(None)));
        assert_eq!(
            parse_command("/log  chat.txt "),
            Some(ChatCommand::Log(Some("chat.txt".into())))
        );
        assert_eq!(parse_command("/exit"), Some(ChatCommand::Quit));
        assert_eq!(
            parse_command("/dance now"),
            Some(ChatCommand::Unknown("dance".into()))
        );
    }

    #[test]
    fn greeting_follows_locale() {
        let (title, hints) = greeting(Locale::Fr);
        assert_eq!(title, "Bonjour ! Comment puis-je vous aider ?");
        assert_eq!(hints.len(), 4);
        assert_eq!(greeting(Locale::En).0, "Hello! How can I help you?");
    }
}
