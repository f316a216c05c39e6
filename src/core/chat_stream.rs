use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tokio::time::{timeout_at, Instant};

use crate::api::{
    ApiErrorEnvelope, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
};
use crate::core::credentials::{CachedCredential, CredentialSource};
use crate::core::message::{Message, TranscriptRole};
use crate::utils::url::stream_generate_url;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Tu es un assistant IA français intelligent, serviable et créatif. Réponds en Markdown de manière concise et élégante.";
pub const DEFAULT_FIRST_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound for either timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const ERROR_SUMMARY_LIMIT: usize = 300;

/// Ordered, finite, non-restartable sequence of reply fragments.
///
/// Yields `None` forever after the first `Err`. Dropping it releases the
/// underlying connection.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    Configuration,
    Transport,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The client cannot issue requests at all, e.g. no credential.
    Configuration(String),
    /// Network failure or timeout, possibly after some fragments arrived.
    Transport(String),
    /// The service answered with an explicit error instead of content.
    Upstream {
        status: Option<u16>,
        message: String,
    },
}

impl GenerationError {
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            GenerationError::Configuration(_) => GenerationErrorKind::Configuration,
            GenerationError::Transport(_) => GenerationErrorKind::Transport,
            GenerationError::Upstream { .. } => GenerationErrorKind::Upstream,
        }
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Configuration(message) => {
                write!(f, "configuration error: {message}")
            }
            GenerationError::Transport(message) => write!(f, "transport error: {message}"),
            GenerationError::Upstream {
                status: Some(status),
                message,
            } => write!(f, "upstream error (HTTP {status}): {message}"),
            GenerationError::Upstream {
                status: None,
                message,
            } => write!(f, "upstream error: {message}"),
        }
    }
}

impl Error for GenerationError {}

/// Produces reply fragments for a conversation prefix plus new user input.
///
/// Implementations hold no conversation state between calls. `stream` must
/// fail synchronously when it cannot issue a request at all, and must not
/// perform network I/O before the returned stream is polled.
pub trait GenerationClient: Send + Sync {
    fn stream(&self, history: &[Message], input: &str) -> Result<FragmentStream, GenerationError>;
}

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    /// Send completed earlier exchanges as context, not just the new input.
    pub include_history: bool,
    pub first_fragment_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            temperature: DEFAULT_TEMPERATURE,
            include_history: true,
            first_fragment_timeout: DEFAULT_FIRST_FRAGMENT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Streams replies from the `streamGenerateContent` endpoint over SSE.
pub struct GeminiClient {
    http: reqwest::Client,
    settings: ClientSettings,
    credential: CachedCredential,
}

impl GeminiClient {
    pub fn new(settings: ClientSettings, credentials: CredentialSource) -> Self {
        Self::with_http_client(reqwest::Client::new(), settings, credentials)
    }

    pub fn with_http_client(
        http: reqwest::Client,
        settings: ClientSettings,
        credentials: CredentialSource,
    ) -> Self {
        Self {
            http,
            settings,
            credential: CachedCredential::new(credentials),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn build_request(&self, history: &[Message], input: &str) -> GenerateContentRequest {
        let mut contents = Vec::new();
        if self.settings.include_history {
            contents.extend(
                completed_exchanges(history)
                    .map(|message| Content::text(message.role.to_api_role(), &message.content)),
            );
        }
        contents.push(Content::text(
            TranscriptRole::User.to_api_role(),
            input.trim(),
        ));

        GenerateContentRequest {
            contents,
            system_instruction: self
                .settings
                .system_instruction
                .as_deref()
                .map(str::trim)
                .filter(|instruction| !instruction.is_empty())
                .map(Content::instruction),
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
            },
        }
    }
}

impl GenerationClient for GeminiClient {
    fn stream(&self, history: &[Message], input: &str) -> Result<FragmentStream, GenerationError> {
        let api_key = self.credential.get().ok_or_else(|| {
            GenerationError::Configuration(format!(
                "missing API key ({})",
                self.credential.source().describe()
            ))
        })?;

        let url = stream_generate_url(&self.settings.base_url, &self.settings.model);
        let body = self.build_request(history, input);
        tracing::debug!(
            model = %self.settings.model,
            context_messages = body.contents.len() - 1,
            "prepared generation request"
        );

        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&body);

        let reader = SseReader::new(
            request,
            self.settings.first_fragment_timeout,
            self.settings.idle_timeout,
        );
        Ok(Box::pin(
            futures_util::stream::unfold(reader, |mut reader| async move {
                let item = reader.next_fragment().await?;
                Some((item, reader))
            })
            .fuse(),
        ))
    }
}

/// Prior messages worth sending as context: each completed user message
/// together with its completed reply. Failed or empty replies drop the whole
/// exchange so roles keep alternating.
fn completed_exchanges(history: &[Message]) -> impl Iterator<Item = &Message> {
    history.iter().enumerate().filter_map(move |(index, message)| {
        let keep = match message.role {
            TranscriptRole::User => history
                .get(index + 1)
                .is_some_and(|reply| reply.is_assistant() && reply.is_context()),
            TranscriptRole::Assistant => {
                message.is_context()
                    && index > 0
                    && history[index - 1].is_user()
                    && history[index - 1].is_context()
            }
        };
        keep.then_some(message)
    })
}

/// Lazily sends the request on first poll, then decodes SSE fragments.
struct SseReader {
    request: Option<reqwest::RequestBuilder>,
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    queued: VecDeque<Result<String, GenerationError>>,
    first_fragment_timeout: Duration,
    idle_timeout: Duration,
    started_at: Option<Instant>,
    last_fragment_at: Option<Instant>,
    finished: bool,
}

impl SseReader {
    fn new(
        request: reqwest::RequestBuilder,
        first_fragment_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            request: Some(request),
            response: None,
            decoder: SseDecoder::default(),
            queued: VecDeque::new(),
            first_fragment_timeout,
            idle_timeout,
            started_at: None,
            last_fragment_at: None,
            finished: false,
        }
    }

    async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>> {
        loop {
            if let Some(item) = self.queued.pop_front() {
                match &item {
                    Ok(_) => self.last_fragment_at = Some(Instant::now()),
                    Err(_) => self.queued.clear(),
                }
                return Some(item);
            }
            if self.finished {
                return None;
            }
            if let Err(error) = self.fill().await {
                self.fail(error);
            }
        }
    }

    fn deadline(&mut self) -> Instant {
        let (from, timeout) = match self.last_fragment_at {
            Some(at) => (at, self.idle_timeout),
            None => (
                *self.started_at.get_or_insert_with(Instant::now),
                self.first_fragment_timeout,
            ),
        };
        from.checked_add(timeout).unwrap_or_else(|| from + MAX_TIMEOUT)
    }

    fn timeout_error(&self) -> GenerationError {
        let message = match self.last_fragment_at {
            Some(_) => format!(
                "no fragment received for {}s",
                self.idle_timeout.as_secs_f32()
            ),
            None => format!(
                "first fragment not received within {}s",
                self.first_fragment_timeout.as_secs_f32()
            ),
        };
        GenerationError::Transport(format!("timed out: {message}"))
    }

    async fn fill(&mut self) -> Result<(), GenerationError> {
        let deadline = self.deadline();

        if let Some(request) = self.request.take() {
            let response = match timeout_at(deadline, request.send()).await {
                Err(_) => return Err(self.timeout_error()),
                Ok(Err(err)) => return Err(GenerationError::Transport(err.to_string())),
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if !status.is_success() {
                let body = timeout_at(deadline, response.text())
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();
                return Err(GenerationError::Upstream {
                    status: Some(status.as_u16()),
                    message: format_api_error(&body)
                        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string()),
                });
            }

            tracing::debug!(status = status.as_u16(), "generation stream opened");
            self.response = Some(response);
            return Ok(());
        }

        let Some(response) = self.response.as_mut() else {
            self.finished = true;
            return Ok(());
        };

        let read = timeout_at(deadline, response.chunk()).await;
        let chunk = match read {
            Err(_) => return Err(self.timeout_error()),
            Ok(Err(err)) => return Err(GenerationError::Transport(err.to_string())),
            Ok(Ok(chunk)) => chunk,
        };

        match chunk {
            Some(bytes) => {
                for payload in self.decoder.push(&bytes) {
                    self.enqueue_payload(&payload)?;
                }
            }
            None => {
                if let Some(payload) = self.decoder.finish() {
                    self.enqueue_payload(&payload)?;
                }
                tracing::debug!("generation stream closed by server");
                self.response = None;
                self.finished = true;
            }
        }
        Ok(())
    }

    fn enqueue_payload(&mut self, payload: &str) -> Result<(), GenerationError> {
        for fragment in decode_payload(payload)? {
            self.queued.push_back(Ok(fragment));
        }
        Ok(())
    }

    /// Queue the error behind any fragments already decoded and stop reading.
    fn fail(&mut self, error: GenerationError) {
        tracing::warn!(error = %error, "generation stream failed");
        self.queued.push_back(Err(error));
        self.request = None;
        self.response = None;
        self.finished = true;
    }
}

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            if let Some(payload) = decode_line(&self.buffer[..newline_pos]) {
                payloads.push(payload);
            }
            self.buffer.drain(..=newline_pos);
        }
        payloads
    }

    /// Decode a trailing line left without a newline at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<String> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(err) => {
            tracing::warn!(error = %err, "skipping invalid UTF-8 line in stream");
            return None;
        }
    };
    extract_data_payload(line)
        .filter(|payload| !payload.is_empty())
        .map(str::to_string)
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Turn one `data:` payload into its text fragments, or an upstream error.
pub(crate) fn decode_payload(payload: &str) -> Result<Vec<String>, GenerationError> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|_| GenerationError::Upstream {
            status: None,
            message: format!("unreadable stream payload: {}", truncate(payload.trim())),
        })?;

    if value.get("error").is_some() {
        return Err(GenerationError::Upstream {
            status: None,
            message: format_api_error(payload).unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    let response: GenerateContentResponse =
        serde_json::from_value(value).map_err(|err| GenerationError::Upstream {
            status: None,
            message: format!("unexpected stream payload: {err}"),
        })?;

    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(GenerationError::Upstream {
            status: None,
            message: format!("prompt blocked: {reason}"),
        });
    }

    Ok(response.text_fragments().map(str::to_string).collect())
}

/// One-line summary of an error body, preferring the envelope's message.
fn format_api_error(error_text: &str) -> Option<String> {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(trimmed) {
        let message = envelope
            .error
            .message
            .as_deref()
            .map(collapse_whitespace)
            .filter(|message| !message.is_empty());
        let label = envelope
            .error
            .status
            .or_else(|| envelope.error.code.map(|code| code.to_string()));
        return match (label, message) {
            (Some(label), Some(message)) => Some(format!("{label}: {message}")),
            (None, Some(message)) => Some(message),
            (Some(label), None) => Some(label),
            (None, None) => Some(truncate(trimmed)),
        };
    }

    Some(truncate(&collapse_whitespace(trimmed)))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(ERROR_SUMMARY_LIMIT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
