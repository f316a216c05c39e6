//! One-shot "say" command: send a single message and stream the reply to stdout

use std::error::Error;
use std::io::{self, Write};

use tokio::sync::broadcast::error::RecvError;

use crate::cli::build_controller;
use crate::core::config::Config;
use crate::core::transcript::TranscriptEvent;
use crate::core::turn::{FailureReason, TurnOutcome};

pub async fn run_say(config: &Config, prompt: Vec<String>) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: causerie say <prompt>");
        std::process::exit(1);
    }

    let controller = build_controller(config);
    let mut events = controller.transcript().subscribe();
    let turn = controller.submit_turn(&prompt)?;
    let reply_id = turn.assistant_message_id();
    let running = tokio::spawn(turn.run());

    let mut stdout = io::stdout();
    loop {
        match events.recv().await {
            Ok(TranscriptEvent::FragmentAppended { id, fragment }) if id == reply_id => {
                write!(stdout, "{fragment}")?;
                stdout.flush()?;
            }
            Ok(TranscriptEvent::MessageFinalized { id }) | Ok(TranscriptEvent::MessageFailed { id, .. })
                if id == reply_id =>
            {
                break
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "output fell behind the reply");
            }
            Err(RecvError::Closed) => break,
        }
    }

    match running.await? {
        TurnOutcome::Finalized { .. } => {
            writeln!(stdout)?;
            Ok(())
        }
        TurnOutcome::Failed {
            content, reason, ..
        } => {
            writeln!(stdout)?;
            if let FailureReason::Generation(err) = &reason {
                eprintln!("❌ Error: {err}");
            }
            eprintln!("{content}");
            std::process::exit(1);
        }
    }
}
