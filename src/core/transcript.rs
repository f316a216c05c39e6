//! The transcript store: one conversation's ordered messages.
//!
//! A [`Transcript`] is a cheap, cloneable handle. Readers take snapshots with
//! [`Transcript::messages`] and follow changes through [`Transcript::subscribe`];
//! every mutation publishes exactly one [`TranscriptEvent`]. Mutation is
//! crate-private so that only the turn controller can grow or seal messages.

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::message::{Message, MessageId, MessageStatus, TranscriptRole};

const EVENT_CAPACITY: usize = 256;

/// Change notification emitted after each transcript mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    MessageAppended { id: MessageId, role: TranscriptRole },
    FragmentAppended { id: MessageId, fragment: String },
    MessageFinalized { id: MessageId },
    MessageFailed { id: MessageId, content: String },
    Cleared,
}

/// What happens to partially streamed content when a turn fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Discard the partial reply and show only the failure text.
    #[default]
    Replace,
    /// Keep the partial reply and append the failure text after a blank line.
    Annotate,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Replace => "replace",
            FailurePolicy::Annotate => "annotate",
        }
    }
}

impl TryFrom<&str> for FailurePolicy {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(FailurePolicy::Replace),
            "annotate" => Ok(FailurePolicy::Annotate),
            other => Err(format!(
                "invalid failure policy: {other} (expected 'replace' or 'annotate')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    UnknownMessage(MessageId),
    Sealed(MessageId),
}

impl fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptError::UnknownMessage(id) => write!(f, "no message with id {id}"),
            TranscriptError::Sealed(id) => write!(f, "message {id} is sealed"),
        }
    }
}

impl Error for TranscriptError {}

struct TranscriptInner {
    messages: Vec<Message>,
    next_id: u64,
}

impl TranscriptInner {
    fn allocate_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId::new(self.next_id)
    }

    fn open_message_mut(&mut self, id: MessageId) -> Result<&mut Message, TranscriptError> {
        let message = self
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.id == id)
            .ok_or(TranscriptError::UnknownMessage(id))?;
        if message.status.is_sealed() {
            return Err(TranscriptError::Sealed(id));
        }
        Ok(message)
    }
}

#[derive(Clone)]
pub struct Transcript {
    inner: Arc<Mutex<TranscriptInner>>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcript")
            .field("len", &self.len())
            .finish()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(TranscriptInner {
                messages: Vec::new(),
                next_id: 0,
            })),
            events,
        }
    }

    /// Receive every change made after this call.
    ///
    /// A receiver that lags behind gets `RecvError::Lagged` and should re-read
    /// [`Transcript::messages`] to resynchronize.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    pub fn last(&self) -> Option<Message> {
        self.inner.lock().unwrap().messages.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages strictly before `id`, in conversation order.
    pub fn history_before(&self, id: MessageId) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        inner
            .messages
            .iter()
            .take_while(|message| message.id != id)
            .cloned()
            .collect()
    }

    pub(crate) fn push_user(&self, content: impl Into<String>) -> MessageId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.allocate_id();
        inner.messages.push(Message::user(id, content));
        self.emit(TranscriptEvent::MessageAppended {
            id,
            role: TranscriptRole::User,
        });
        id
    }

    pub(crate) fn push_assistant_placeholder(&self) -> MessageId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.allocate_id();
        inner.messages.push(Message::assistant_placeholder(id));
        self.emit(TranscriptEvent::MessageAppended {
            id,
            role: TranscriptRole::Assistant,
        });
        id
    }

    pub(crate) fn append_fragment(
        &self,
        id: MessageId,
        fragment: &str,
    ) -> Result<(), TranscriptError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open_message_mut(id)?.content.push_str(fragment);
        self.emit(TranscriptEvent::FragmentAppended {
            id,
            fragment: fragment.to_string(),
        });
        Ok(())
    }

    /// Seal a streaming message as complete and return its final content.
    pub(crate) fn finalize(&self, id: MessageId) -> Result<String, TranscriptError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.open_message_mut(id)?;
        message.status = MessageStatus::Complete;
        let content = message.content.clone();
        self.emit(TranscriptEvent::MessageFinalized { id });
        Ok(content)
    }

    /// Seal a streaming message as failed, rewriting its content per `policy`.
    pub(crate) fn fail(
        &self,
        id: MessageId,
        failure_text: &str,
        policy: FailurePolicy,
    ) -> Result<String, TranscriptError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.open_message_mut(id)?;
        match policy {
            FailurePolicy::Replace => {
                message.content = failure_text.to_string();
            }
            FailurePolicy::Annotate if message.content.trim().is_empty() => {
                message.content = failure_text.to_string();
            }
            FailurePolicy::Annotate => {
                message.content.push_str("\n\n");
                message.content.push_str(failure_text);
            }
        }
        message.status = MessageStatus::Failed;
        let content = message.content.clone();
        self.emit(TranscriptEvent::MessageFailed {
            id,
            content: content.clone(),
        });
        Ok(content)
    }

    /// Drop every message. Ids keep counting up so none is ever reused.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages.clear();
        self.emit(TranscriptEvent::Cleared);
    }

    // Called with the lock held so that event order matches mutation order.
    fn emit(&self, event: TranscriptEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_keep_insertion_order_and_unique_ids() {
        let transcript = Transcript::new();
        let user = transcript.push_user("Hello");
        let assistant = transcript.push_assistant_placeholder();

        let messages = transcript.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, user);
        assert_eq!(messages[0].role, TranscriptRole::User);
        assert_eq!(messages[1].id, assistant);
        assert_eq!(messages[1].content, "");
        assert_ne!(user, assistant);
    }

    #[test]
    fn fragments_concatenate_in_delivery_order() {
        let transcript = Transcript::new();
        transcript.push_user("Hello");
        let id = transcript.push_assistant_placeholder();

        for fragment in ["Bon", "jour", "jour", " !"] {
            transcript.append_fragment(id, fragment).expect("append");
        }

        assert_eq!(transcript.get(id).expect("message").content, "Bonjourjour !");
    }

    #[test]
    fn finalized_messages_reject_further_mutation() {
        let transcript = Transcript::new();
        let id = transcript.push_assistant_placeholder();
        transcript.append_fragment(id, "Done").expect("append");
        assert_eq!(transcript.finalize(id).expect("finalize"), "Done");

        assert_eq!(
            transcript.append_fragment(id, "more"),
            Err(TranscriptError::Sealed(id))
        );
        assert_eq!(
            transcript.fail(id, "oops", FailurePolicy::Replace),
            Err(TranscriptError::Sealed(id))
        );
        let message = transcript.get(id).expect("message");
        assert_eq!(message.content, "Done");
        assert_eq!(message.status, MessageStatus::Complete);
    }

    #[test]
    fn user_messages_cannot_be_appended_to() {
        let transcript = Transcript::new();
        let id = transcript.push_user("Hi");
        assert_eq!(
            transcript.append_fragment(id, "!"),
            Err(TranscriptError::Sealed(id))
        );
    }

    #[test]
    fn replace_policy_discards_partial_content() {
        let transcript = Transcript::new();
        let id = transcript.push_assistant_placeholder();
        transcript.append_fragment(id, "He").expect("append");

        let content = transcript
            .fail(id, "error text", FailurePolicy::Replace)
            .expect("fail");

        assert_eq!(content, "error text");
        assert_eq!(transcript.get(id).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn annotate_policy_keeps_partial_content() {
        let transcript = Transcript::new();
        let id = transcript.push_assistant_placeholder();
        transcript.append_fragment(id, "He").expect("append");

        let content = transcript
            .fail(id, "error text", FailurePolicy::Annotate)
            .expect("fail");
        assert_eq!(content, "He\n\nerror text");

        let empty = transcript.push_assistant_placeholder();
        let content = transcript
            .fail(empty, "error text", FailurePolicy::Annotate)
            .expect("fail");
        assert_eq!(content, "error text");
    }

    #[test]
    fn unknown_ids_are_reported() {
        let transcript = Transcript::new();
        let stray = MessageId::new(42);
        assert_eq!(
            transcript.append_fragment(stray, "x"),
            Err(TranscriptError::UnknownMessage(stray))
        );
    }

    #[test]
    fn history_before_excludes_the_pivot_and_later() {
        let transcript = Transcript::new();
        let first = transcript.push_user("one");
        let reply = transcript.push_assistant_placeholder();
        transcript.append_fragment(reply, "two").unwrap();
        transcript.finalize(reply).unwrap();
        let second = transcript.push_user("three");
        transcript.push_assistant_placeholder();

        let history = transcript.history_before(second);
        let ids: Vec<_> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, reply]);
    }

    #[test]
    fn clear_never_reuses_ids() {
        let transcript = Transcript::new();
        let before = transcript.push_user("a");
        transcript.clear();
        assert!(transcript.is_empty());
        let after = transcript.push_user("b");
        assert!(after > before);
    }

    #[test]
    fn every_mutation_emits_one_event_in_order() {
        let transcript = Transcript::new();
        let mut events = transcript.subscribe();

        let user = transcript.push_user("Hello");
        let id = transcript.push_assistant_placeholder();
        transcript.append_fragment(id, "Bon").unwrap();
        transcript.append_fragment(id, "jour").unwrap();
        transcript.finalize(id).unwrap();
        transcript.clear();

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![
                TranscriptEvent::MessageAppended {
                    id: user,
                    role: TranscriptRole::User
                },
                TranscriptEvent::MessageAppended {
                    id,
                    role: TranscriptRole::Assistant
                },
                TranscriptEvent::FragmentAppended {
                    id,
                    fragment: "Bon".into()
                },
                TranscriptEvent::FragmentAppended {
                    id,
                    fragment: "jour".into()
                },
                TranscriptEvent::MessageFinalized { id },
                TranscriptEvent::Cleared,
            ]
        );
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!(
            FailurePolicy::try_from("Annotate"),
            Ok(FailurePolicy::Annotate)
        );
        assert!(FailurePolicy::try_from("keep").is_err());
    }
}
