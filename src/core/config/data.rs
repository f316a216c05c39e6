use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::chat_stream::{
    ClientSettings, DEFAULT_BASE_URL, DEFAULT_FIRST_FRAGMENT_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_TEMPERATURE, MAX_TIMEOUT,
};
use crate::core::credentials::{CredentialSource, DEFAULT_API_KEY_ENV};
use crate::core::transcript::FailurePolicy;
use crate::core::turn::{FailureMessages, Locale, TurnSettings};

/// On-disk configuration. Every field is optional; accessors supply defaults.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Model id, e.g. "gemini-3-flash-preview"
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// Persona sent as the system instruction. An empty string disables it.
    pub system_instruction: Option<String>,
    pub base_url: Option<String>,
    /// Environment variables searched, in order, for the API key
    pub api_key_env: Option<Vec<String>>,
    /// Send prior completed exchanges along with each new message
    pub include_history: Option<bool>,
    pub first_fragment_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub failure_policy: Option<FailurePolicy>,
    pub locale: Option<Locale>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/causerie/config.toml` → `~/.config/causerie/config.toml`
/// - Windows: paths are shown unchanged
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Zero falls back to `default`; anything longer than [`MAX_TIMEOUT`] is capped.
fn timeout_from_secs(secs: Option<u64>, default: Duration) -> Duration {
    match secs {
        None | Some(0) => default,
        Some(secs) => Duration::from_secs(secs).min(MAX_TIMEOUT),
    }
}

impl Config {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn system_instruction(&self) -> Option<&str> {
        match self.system_instruction.as_deref() {
            Some(text) if text.trim().is_empty() => None,
            Some(text) => Some(text),
            None => Some(DEFAULT_SYSTEM_INSTRUCTION),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn api_key_env(&self) -> Vec<String> {
        match &self.api_key_env {
            Some(names) => names.clone(),
            None => DEFAULT_API_KEY_ENV.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn include_history(&self) -> bool {
        self.include_history.unwrap_or(true)
    }

    pub fn first_fragment_timeout(&self) -> Duration {
        timeout_from_secs(self.first_fragment_timeout_secs, DEFAULT_FIRST_FRAGMENT_TIMEOUT)
    }

    pub fn idle_timeout(&self) -> Duration {
        timeout_from_secs(self.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }

    pub fn locale(&self) -> Locale {
        self.locale.unwrap_or_default()
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.base_url().to_string(),
            model: self.model().to_string(),
            system_instruction: self.system_instruction().map(str::to_string),
            temperature: self.temperature(),
            include_history: self.include_history(),
            first_fragment_timeout: self.first_fragment_timeout(),
            idle_timeout: self.idle_timeout(),
        }
    }

    pub fn credential_source(&self) -> CredentialSource {
        CredentialSource::Env(self.api_key_env())
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            failure_policy: self.failure_policy(),
            messages: FailureMessages::for_locale(self.locale()),
        }
    }
}
