use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::core::chat_stream::{FragmentStream, GenerationClient, GenerationError};
use crate::core::message::Message;

/// One scripted item produced by [`ScriptedClient`].
#[derive(Clone, Debug)]
pub enum ScriptItem {
    Fragment(String),
    Fail(GenerationError),
    /// Suspend until the gate is released with [`ScriptedClient::release`].
    Gate,
}

pub fn fragment(text: &str) -> ScriptItem {
    ScriptItem::Fragment(text.to_string())
}

/// Call recorded by [`ScriptedClient`].
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub history: Vec<Message>,
    pub input: String,
}

/// In-memory generation client that replays scripts, one per call.
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    open_error: Mutex<Option<GenerationError>>,
    calls: Mutex<Vec<RecordedCall>>,
    invocations: AtomicUsize,
    gate: Arc<Notify>,
    live_streams: Arc<AtomicUsize>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            open_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            gate: Arc::new(Notify::new()),
            live_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// A client whose `stream` call itself fails, like a missing credential.
    pub fn failing_on_open(error: GenerationError) -> Arc<Self> {
        let client = Self::new(Vec::new());
        *client.open_error.lock().unwrap() = Some(error);
        client
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Streams handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationClient for ScriptedClient {
    fn stream(&self, history: &[Message], input: &str) -> Result<FragmentStream, GenerationError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            history: history.to_vec(),
            input: input.to_string(),
        });
        if let Some(error) = self.open_error.lock().unwrap().clone() {
            return Err(error);
        }

        let script: VecDeque<ScriptItem> = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
            .into();
        let gate = self.gate.clone();
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live_streams.clone());

        Ok(Box::pin(
            futures_util::stream::unfold(
                (script, gate, guard, false),
                |(mut script, gate, guard, failed)| async move {
                    if failed {
                        return None;
                    }
                    loop {
                        match script.pop_front()? {
                            ScriptItem::Gate => gate.notified().await,
                            ScriptItem::Fragment(text) => {
                                return Some((Ok(text), (script, gate, guard, false)))
                            }
                            ScriptItem::Fail(error) => {
                                return Some((Err(error), (script, gate, guard, true)))
                            }
                        }
                    }
                },
            )
            .fuse(),
        ))
    }
}

/// A `data:` event carrying one text part, as the service frames it.
pub fn sse_event(text: &str) -> String {
    let payload = serde_json::json!({
        "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }]
    });
    format!("data: {payload}\r\n\r\n")
}

#[derive(Clone, Debug)]
pub enum ServerStep {
    Chunk(String),
    Sleep(Duration),
    /// Close the socket without terminating the chunked body.
    Abort,
}

#[derive(Debug)]
pub struct CapturedRequest {
    pub head: String,
    pub body: String,
}

pub struct SseServer {
    pub base_url: String,
    pub requests: mpsc::UnboundedReceiver<CapturedRequest>,
}

/// Minimal HTTP/1.1 server answering every connection with `status` and a
/// chunked body built from `steps`.
pub async fn spawn_sse_server(status: u16, steps: Vec<ServerStep>) -> SseServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let steps = steps.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = serve_connection(socket, status, steps, tx).await;
            });
        }
    });

    SseServer {
        base_url: format!("http://{addr}"),
        requests: rx,
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    status: u16,
    steps: Vec<ServerStep>,
    tx: mpsc::UnboundedSender<CapturedRequest>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < head_end + content_length {
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body_end = buffer.len().min(head_end + content_length);
    let body = String::from_utf8_lossy(&buffer[head_end..body_end]).to_string();
    let _ = tx.send(CapturedRequest { head, body });

    let reason = if status < 400 { "OK" } else { "Error" };
    let response_head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    socket.write_all(response_head.as_bytes()).await?;
    socket.flush().await?;

    for step in steps {
        match step {
            ServerStep::Chunk(data) => {
                let framed = format!("{:x}\r\n{}\r\n", data.len(), data);
                socket.write_all(framed.as_bytes()).await?;
                socket.flush().await?;
            }
            ServerStep::Sleep(duration) => tokio::time::sleep(duration).await,
            ServerStep::Abort => return Ok(()),
        }
    }

    socket.write_all(b"0\r\n\r\n").await?;
    socket.flush().await?;
    Ok(())
}
