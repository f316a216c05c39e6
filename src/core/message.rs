use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier assigned by the transcript when a message is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl TranscriptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
        }
    }

    /// Role name used by the generation endpoint's `contents` array.
    pub fn to_api_role(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "model",
        }
    }

    pub fn is_user(self) -> bool {
        self == TranscriptRole::User
    }

    pub fn is_assistant(self) -> bool {
        self == TranscriptRole::Assistant
    }
}

impl AsRef<str> for TranscriptRole {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TranscriptRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(TranscriptRole::User),
            "assistant" => Ok(TranscriptRole::Assistant),
            _ => Err(format!("invalid transcript role: {value}")),
        }
    }
}

impl TryFrom<String> for TranscriptRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<TranscriptRole> for String {
    fn from(value: TranscriptRole) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle of a message's content.
///
/// Only `Streaming` content may change. `Complete` and `Failed` are sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant placeholder still receiving fragments.
    Streaming,

    /// User input, or an assistant reply whose stream ended normally.
    Complete,

    /// Assistant reply whose turn ended in an error or was cancelled.
    Failed,
}

impl MessageStatus {
    pub fn is_sealed(self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: TranscriptRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub(crate) fn user(id: MessageId, content: impl Into<String>) -> Self {
        Self {
            id,
            role: TranscriptRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Complete,
        }
    }

    pub(crate) fn assistant_placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: TranscriptRole::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Streaming,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    /// Whether this message is fit to be sent back to the model as context.
    pub fn is_context(&self) -> bool {
        self.status == MessageStatus::Complete && !self.content.trim().is_empty()
    }

    /// Local wall-clock time of creation, formatted for display.
    pub fn display_time(&self) -> String {
        self.timestamp
            .with_timezone(&chrono::Local)
            .format("%H:%M")
            .to_string()
    }
}
