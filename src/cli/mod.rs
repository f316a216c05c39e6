//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod say;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::chat::run_chat;
use crate::cli::say::run_say;
use crate::core::chat_stream::GeminiClient;
use crate::core::config::Config;
use crate::core::transcript::Transcript;
use crate::core::turn::TurnController;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ", built ",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "causerie")]
#[command(version = VERSION)]
#[command(about = "A streaming terminal chat client for Gemini models")]
#[command(
    long_about = "Causerie streams replies from a Gemini model into a simple line-oriented \
chat session. Each reply appears fragment by fragment as it is generated.\n\n\
Environment Variables:\n\
  API_KEY           API key for the generation service\n\
  GEMINI_API_KEY    Used when API_KEY is not set\n\
  CAUSERIE_LOG      Diagnostic log filter (default: warn)\n\n\
Commands:\n\
  /new              Start a new conversation\n\
  /stop             Cancel the reply being generated\n\
  /log <filename>   Enable logging to specified file\n\
  /log              Toggle logging pause/resume\n\
  /help             Show this list\n\
  /quit             Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use instead of the configured one
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Sampling temperature for this run
    #[arg(long, global = true, value_name = "TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Enable logging to specified file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<String>,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat interface (default)
    Chat,
    /// Send a single message and print the reply
    Say {
        /// The message to send
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        prompt: Vec<String>,
    },
    /// Set configuration values
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set for the key (can be multiple words)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
    /// Show the effective configuration
    Config,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("CAUSERIE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config_path = Config::resolve_path(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Chat) {
        Commands::Set { key, value } => {
            let mut config = Config::load_from_path(&config_path)?;
            match config.set_value(&key, &value.join(" ")) {
                Ok(message) => {
                    config.save_to_path(&config_path)?;
                    println!("{message}");
                }
                Err(err) => {
                    err.print();
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load_from_path(&config_path)?;
            match config.unset_value(&key) {
                Ok(message) => {
                    config.save_to_path(&config_path)?;
                    println!("{message}");
                }
                Err(err) => {
                    err.print();
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Config => {
            Config::load_from_path(&config_path)?.print_all(&config_path);
            Ok(())
        }
        Commands::Say { prompt } => {
            let config = Config::load_from_path(&config_path)?;
            let config = apply_overrides(config, &args.model, args.temperature);
            run_say(&config, prompt).await
        }
        Commands::Chat => {
            let config = Config::load_from_path(&config_path)?;
            let config = apply_overrides(config, &args.model, args.temperature);
            run_chat(&config, args.log).await
        }
    }
}

/// Per-run flags win over the file; they are never persisted.
fn apply_overrides(mut config: Config, model: &Option<String>, temperature: Option<f32>) -> Config {
    if let Some(model) = model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        config.model = Some(model.to_string());
    }
    if let Some(temperature) = temperature {
        config.temperature = Some(temperature);
    }
    config
}

pub(crate) fn build_controller(config: &Config) -> TurnController {
    let client = GeminiClient::new(config.client_settings(), config.credential_source());
    tracing::debug!(model = config.model(), base_url = config.base_url(), "controller ready");
    TurnController::new(Transcript::new(), Arc::new(client), config.turn_settings())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_chat() {
        let args = Args::try_parse_from(["causerie"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn say_collects_the_whole_prompt() {
        let args = Args::try_parse_from(["causerie", "say", "Bonjour", "le", "monde"]).unwrap();
        match args.command {
            Some(Commands::Say { prompt }) => assert_eq!(prompt, vec!["Bonjour", "le", "monde"]),
            _ => panic!("expected say"),
        }
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let args = Args::try_parse_from(["causerie", "chat", "-m", "gemini-pro", "--temperature", "0.2"])
            .unwrap();
        assert_eq!(args.model.as_deref(), Some("gemini-pro"));
        assert_eq!(args.temperature, Some(0.2));
    }

    #[test]
    fn overrides_replace_file_values_but_ignore_blank_models() {
        let config = Config {
            model: Some("from-file".into()),
            ..Default::default()
        };
        let config = apply_overrides(config, &Some("  ".into()), Some(1.0));
        assert_eq!(config.model(), "from-file");
        assert_eq!(config.temperature(), 1.0);

        let config = apply_overrides(config, &Some("cli-model".into()), None);
        assert_eq!(config.model(), "cli-model");
    }

    #[test]
    fn set_joins_multi_word_values() {
        let args =
            Args::try_parse_from(["causerie", "set", "system-instruction", "Sois", "bref."]).unwrap();
        match args.command {
            Some(Commands::Set { key, value }) => {
                assert_eq!(key, "system-instruction");
                assert_eq!(value.join(" "), "Sois bref.");
            }
            _ => panic!("expected set"),
        }
    }
}
