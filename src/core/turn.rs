//! Turn orchestration: one user submission through to a sealed reply.
//!
//! [`TurnController::submit_turn`] validates input, claims the conversation,
//! appends the user message and an empty assistant placeholder, and opens the
//! generation stream, all before returning. The returned [`ActiveTurn`] is
//! then driven with [`ActiveTurn::run`], which folds fragments into the
//! placeholder and seals it as complete or failed.
//!
//! At most one turn is active per controller. Submissions made while a turn
//! is active are rejected without touching the transcript.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::chat_stream::{FragmentStream, GenerationClient, GenerationError};
use crate::core::message::MessageId;
use crate::core::transcript::{FailurePolicy, Transcript, TranscriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingFirstChunk,
    Streaming,
    Finalized,
    Failed,
}

impl TurnState {
    pub fn is_active(self) -> bool {
        matches!(self, TurnState::AwaitingFirstChunk | TurnState::Streaming)
    }
}

/// Why a submission was refused. The transcript is untouched in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyInput,
    TurnActive,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyInput => write!(f, "message is empty"),
            ValidationError::TurnActive => write!(f, "a reply is still being generated"),
        }
    }
}

impl Error for ValidationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Fr,
    En,
}

impl Locale {
    pub fn as_str(self) -> &'static str {
        match self {
            Locale::Fr => "fr",
            Locale::En => "en",
        }
    }
}

impl TryFrom<&str> for Locale {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fr" => Ok(Locale::Fr),
            "en" => Ok(Locale::En),
            other => Err(format!("unsupported locale: {other} (expected 'fr' or 'en')")),
        }
    }
}

/// User-facing texts written into a failed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMessages {
    pub generation_failed: String,
    pub cancelled: String,
}

impl FailureMessages {
    pub fn for_locale(locale: Locale) -> Self {
        let (generation_failed, cancelled) = match locale {
            Locale::Fr => (
                "Désolé, une erreur s'est produite lors de la génération de la réponse.",
                "Génération annulée.",
            ),
            Locale::En => (
                "Sorry, something went wrong while generating the response.",
                "Generation cancelled.",
            ),
        };
        Self {
            generation_failed: generation_failed.to_string(),
            cancelled: cancelled.to_string(),
        }
    }
}

impl Default for FailureMessages {
    fn default() -> Self {
        Self::for_locale(Locale::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnSettings {
    pub failure_policy: FailurePolicy,
    pub messages: FailureMessages,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Generation(GenerationError),
    Cancelled,
    /// The placeholder could not be updated; indicates a controller bug.
    Transcript(TranscriptError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Finalized {
        message_id: MessageId,
        content: String,
    },
    Failed {
        message_id: MessageId,
        content: String,
        reason: FailureReason,
    },
}

impl TurnOutcome {
    pub fn message_id(&self) -> MessageId {
        match self {
            TurnOutcome::Finalized { message_id, .. } | TurnOutcome::Failed { message_id, .. } => {
                *message_id
            }
        }
    }

    /// Final content of the assistant message as shown in the transcript.
    pub fn content(&self) -> &str {
        match self {
            TurnOutcome::Finalized { content, .. } | TurnOutcome::Failed { content, .. } => content,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, TurnOutcome::Finalized { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TurnOutcome::Failed {
                reason: FailureReason::Cancelled,
                ..
            }
        )
    }
}

pub struct TurnController {
    transcript: Transcript,
    client: Arc<dyn GenerationClient>,
    settings: Arc<TurnSettings>,
    state: Arc<watch::Sender<TurnState>>,
    active_cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnController {
    pub fn new(
        transcript: Transcript,
        client: Arc<dyn GenerationClient>,
        settings: TurnSettings,
    ) -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        Self {
            transcript,
            client,
            settings: Arc::new(settings),
            state: Arc::new(state),
            active_cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Whether input should currently be gated.
    pub fn turn_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn watch_state(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Accept or reject a submission.
    ///
    /// On acceptance the user message and the empty assistant placeholder are
    /// already in the transcript and the generation stream has been requested.
    /// A client that fails synchronously still yields an `ActiveTurn`; its
    /// error surfaces as the turn's failure when run.
    pub fn submit_turn(&self, text: &str) -> Result<ActiveTurn, ValidationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyInput);
        }

        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = TurnState::AwaitingFirstChunk;
                true
            }
        });
        if !claimed {
            tracing::debug!("rejected submission while a turn is active");
            return Err(ValidationError::TurnActive);
        }

        let user_id = self.transcript.push_user(text);
        let assistant_id = self.transcript.push_assistant_placeholder();
        let history = self.transcript.history_before(user_id);
        let opened = self.client.stream(&history, text);
        if let Err(error) = &opened {
            tracing::warn!(error = %error, "generation client refused the request");
        }
        tracing::debug!(
            user = %user_id,
            assistant = %assistant_id,
            history = history.len(),
            "turn started"
        );

        let cancel = CancellationToken::new();
        *self.active_cancel.lock().unwrap() = Some(cancel.clone());

        Ok(ActiveTurn {
            transcript: self.transcript.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            active_cancel: self.active_cancel.clone(),
            user_id,
            assistant_id,
            stream: Some(opened),
            cancel,
            concluded: false,
        })
    }

    /// Submit and drive the turn to completion.
    pub async fn send(&self, text: &str) -> Result<TurnOutcome, ValidationError> {
        Ok(self.submit_turn(text)?.run().await)
    }

    /// Cancel the active turn, if any. Returns whether one was signalled.
    pub fn cancel_active_turn(&self) -> bool {
        match self.active_cancel.lock().unwrap().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start over with an empty transcript. Refused while a turn is active.
    pub fn new_conversation(&self) -> Result<(), ValidationError> {
        let transcript = &self.transcript;
        let mut rejected = false;
        self.state.send_if_modified(|state| {
            if state.is_active() {
                rejected = true;
                return false;
            }
            transcript.clear();
            *state = TurnState::Idle;
            true
        });
        if rejected {
            return Err(ValidationError::TurnActive);
        }
        tracing::debug!("conversation cleared");
        Ok(())
    }
}

enum Step {
    Cancelled,
    Item(Option<Result<String, GenerationError>>),
}

/// An accepted submission whose reply has not reached a terminal state yet.
///
/// Dropping it before [`ActiveTurn::run`] completes cancels the turn.
pub struct ActiveTurn {
    transcript: Transcript,
    settings: Arc<TurnSettings>,
    state: Arc<watch::Sender<TurnState>>,
    active_cancel: Arc<Mutex<Option<CancellationToken>>>,
    user_id: MessageId,
    assistant_id: MessageId,
    stream: Option<Result<FragmentStream, GenerationError>>,
    cancel: CancellationToken,
    concluded: bool,
}

impl fmt::Debug for ActiveTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTurn")
            .field("user_id", &self.user_id)
            .field("assistant_id", &self.assistant_id)
            .field("concluded", &self.concluded)
            .finish()
    }
}

impl ActiveTurn {
    pub fn user_message_id(&self) -> MessageId {
        self.user_id
    }

    pub fn assistant_message_id(&self) -> MessageId {
        self.assistant_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> TurnOutcome {
        let mut stream = match self.stream.take() {
            Some(Ok(stream)) => stream,
            Some(Err(error)) => return self.conclude_failed(FailureReason::Generation(error)),
            None => return self.conclude_failed(FailureReason::Cancelled),
        };
        let cancel = self.cancel.clone();

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                item = stream.next() => Step::Item(item),
            };

            match step {
                Step::Item(Some(Ok(fragment))) => {
                    if let Err(error) = self.fold(&fragment) {
                        drop(stream);
                        return self.conclude_failed(FailureReason::Transcript(error));
                    }
                }
                Step::Item(Some(Err(error))) => {
                    drop(stream);
                    return self.conclude_failed(FailureReason::Generation(error));
                }
                Step::Item(None) => {
                    drop(stream);
                    return self.conclude_finalized();
                }
                Step::Cancelled => {
                    drop(stream);
                    return self.conclude_failed(FailureReason::Cancelled);
                }
            }
        }
    }

    fn fold(&self, fragment: &str) -> Result<(), TranscriptError> {
        if fragment.is_empty() {
            return Ok(());
        }
        self.transcript.append_fragment(self.assistant_id, fragment)?;
        self.state.send_if_modified(|state| {
            if *state == TurnState::AwaitingFirstChunk {
                *state = TurnState::Streaming;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn conclude_finalized(&mut self) -> TurnOutcome {
        match self.transcript.finalize(self.assistant_id) {
            Ok(content) => {
                self.concluded = true;
                self.release(TurnState::Finalized);
                tracing::debug!(
                    assistant = %self.assistant_id,
                    chars = content.chars().count(),
                    "turn finalized"
                );
                TurnOutcome::Finalized {
                    message_id: self.assistant_id,
                    content,
                }
            }
            Err(error) => self.conclude_failed(FailureReason::Transcript(error)),
        }
    }

    fn conclude_failed(&mut self, reason: FailureReason) -> TurnOutcome {
        self.concluded = true;
        self.stream = None;

        let failure_text = match &reason {
            FailureReason::Cancelled => {
                tracing::info!(assistant = %self.assistant_id, "turn cancelled");
                self.settings.messages.cancelled.as_str()
            }
            FailureReason::Generation(error) => {
                tracing::warn!(
                    assistant = %self.assistant_id,
                    kind = ?error.kind(),
                    error = %error,
                    "turn failed"
                );
                self.settings.messages.generation_failed.as_str()
            }
            FailureReason::Transcript(error) => {
                tracing::error!(assistant = %self.assistant_id, error = %error, "turn lost its placeholder");
                self.settings.messages.generation_failed.as_str()
            }
        };

        let content = self
            .transcript
            .fail(self.assistant_id, failure_text, self.settings.failure_policy)
            .unwrap_or_else(|error| {
                tracing::error!(assistant = %self.assistant_id, error = %error, "could not mark reply as failed");
                failure_text.to_string()
            });
        self.release(TurnState::Failed);

        TurnOutcome::Failed {
            message_id: self.assistant_id,
            content,
            reason,
        }
    }

    fn release(&self, terminal: TurnState) {
        self.active_cancel.lock().unwrap().take();
        self.state.send_replace(terminal);
    }
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        if !self.concluded {
            self.conclude_failed(FailureReason::Cancelled);
        }
    }
}
