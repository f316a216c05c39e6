//! `set` / `unset` by key for the CLI.

use std::fmt;

use crate::core::chat_stream::MAX_TIMEOUT;
use crate::core::config::data::Config;
use crate::core::transcript::FailurePolicy;
use crate::core::turn::Locale;

/// Keys in display order.
pub const SETTING_KEYS: &[&str] = &[
    "model",
    "temperature",
    "system-instruction",
    "base-url",
    "api-key-env",
    "include-history",
    "first-fragment-timeout",
    "idle-timeout",
    "failure-policy",
    "locale",
];

/// Errors that can occur when modifying configuration settings.
#[derive(Debug, PartialEq)]
pub enum SettingError {
    UnknownKey(String),
    InvalidValue {
        key: &'static str,
        input: String,
        expected: &'static str,
    },
    MissingValue(&'static str),
}

impl SettingError {
    /// Print the error message to stderr with appropriate formatting.
    pub fn print(&self) {
        match self {
            SettingError::UnknownKey(key) => {
                eprintln!("❌ Unknown config key: {key}");
                eprintln!("   Known keys: {}", SETTING_KEYS.join(", "));
            }
            SettingError::InvalidValue {
                key,
                input,
                expected,
            } => {
                eprintln!("❌ Invalid value for {key}: {input}");
                eprintln!("   Expected {expected}");
            }
            SettingError::MissingValue(key) => {
                eprintln!("⚠️  A value is required for {key}");
                eprintln!("Example: causerie set {key} <value>");
            }
        }
    }
}

impl fmt::Display for SettingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingError::UnknownKey(key) => write!(f, "Unknown config key: {key}"),
            SettingError::InvalidValue {
                key,
                input,
                expected,
            } => write!(f, "Invalid value for {key}: {input} (expected {expected})"),
            SettingError::MissingValue(key) => write!(f, "A value is required for {key}"),
        }
    }
}

impl std::error::Error for SettingError {}

fn canonical_key(key: &str) -> Result<&'static str, SettingError> {
    let normalized = key.trim().to_ascii_lowercase().replace('_', "-");
    SETTING_KEYS
        .iter()
        .copied()
        .find(|candidate| *candidate == normalized)
        .ok_or_else(|| SettingError::UnknownKey(key.to_string()))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, SettingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(SettingError::InvalidValue {
            key,
            input: value.to_string(),
            expected: "on or off",
        }),
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, SettingError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| (1..=MAX_TIMEOUT.as_secs()).contains(secs))
        .ok_or_else(|| SettingError::InvalidValue {
            key,
            input: value.to_string(),
            expected: "a number of seconds between 1 and 86400",
        })
}

impl Config {
    /// Apply `value` to `key`, returning the confirmation to display.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<String, SettingError> {
        let key = canonical_key(key)?;
        let value = value.trim();
        // An empty persona is meaningful: it disables the system instruction.
        if value.is_empty() && key != "system-instruction" {
            return Err(SettingError::MissingValue(key));
        }

        match key {
            "model" => self.model = Some(value.to_string()),
            "temperature" => {
                let temperature = value
                    .parse::<f32>()
                    .ok()
                    .filter(|t| (0.0..=2.0).contains(t))
                    .ok_or_else(|| SettingError::InvalidValue {
                        key,
                        input: value.to_string(),
                        expected: "a number between 0 and 2",
                    })?;
                self.temperature = Some(temperature);
            }
            "system-instruction" => self.system_instruction = Some(value.to_string()),
            "base-url" => self.base_url = Some(value.to_string()),
            "api-key-env" => {
                let names: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
                if names.is_empty() {
                    return Err(SettingError::MissingValue(key));
                }
                self.api_key_env = Some(names);
            }
            "include-history" => self.include_history = Some(parse_bool(key, value)?),
            "first-fragment-timeout" => {
                self.first_fragment_timeout_secs = Some(parse_secs(key, value)?)
            }
            "idle-timeout" => self.idle_timeout_secs = Some(parse_secs(key, value)?),
            "failure-policy" => {
                let policy = FailurePolicy::try_from(value).map_err(|_| {
                    SettingError::InvalidValue {
                        key,
                        input: value.to_string(),
                        expected: "replace or annotate",
                    }
                })?;
                self.failure_policy = Some(policy);
            }
            "locale" => {
                let locale = Locale::try_from(value).map_err(|_| SettingError::InvalidValue {
                    key,
                    input: value.to_string(),
                    expected: "fr or en",
                })?;
                self.locale = Some(locale);
            }
            _ => return Err(SettingError::UnknownKey(key.to_string())),
        }

        Ok(format!("✅ Set {key} to: {}", self.format_value(key)))
    }

    /// Reset `key` to its default.
    pub fn unset_value(&mut self, key: &str) -> Result<String, SettingError> {
        let key = canonical_key(key)?;
        match key {
            "model" => self.model = None,
            "temperature" => self.temperature = None,
            "system-instruction" => self.system_instruction = None,
            "base-url" => self.base_url = None,
            "api-key-env" => self.api_key_env = None,
            "include-history" => self.include_history = None,
            "first-fragment-timeout" => self.first_fragment_timeout_secs = None,
            "idle-timeout" => self.idle_timeout_secs = None,
            "failure-policy" => self.failure_policy = None,
            "locale" => self.locale = None,
            _ => return Err(SettingError::UnknownKey(key.to_string())),
        }
        Ok(format!("✅ Unset {key}"))
    }

    /// Effective value of `key`, marked when it comes from the defaults.
    pub fn format_value(&self, key: &str) -> String {
        let (value, explicit) = match key {
            "model" => (self.model().to_string(), self.model.is_some()),
            "temperature" => (self.temperature().to_string(), self.temperature.is_some()),
            "system-instruction" => (
                self.system_instruction().unwrap_or("(none)").to_string(),
                self.system_instruction.is_some(),
            ),
            "base-url" => (self.base_url().to_string(), self.base_url.is_some()),
            "api-key-env" => (self.api_key_env().join(", "), self.api_key_env.is_some()),
            "include-history" => (
                if self.include_history() { "on" } else { "off" }.to_string(),
                self.include_history.is_some(),
            ),
            "first-fragment-timeout" => (
                format!("{}s", self.first_fragment_timeout().as_secs()),
                self.first_fragment_timeout_secs.is_some(),
            ),
            "idle-timeout" => (
                format!("{}s", self.idle_timeout().as_secs()),
                self.idle_timeout_secs.is_some(),
            ),
            "failure-policy" => (
                self.failure_policy().as_str().to_string(),
                self.failure_policy.is_some(),
            ),
            "locale" => (self.locale().as_str().to_string(), self.locale.is_some()),
            _ => return "(unknown)".to_string(),
        };
        if explicit {
            value
        } else {
            format!("{value} (default)")
        }
    }
}
