//! Client-side session protocol.
//!
//! Frontends embed [`SessionClient`] to drive the init / ready / audio
//! exchange against the relay without reimplementing its ordering rules.
//! Capture usually starts before the server confirms the session, so chunks
//! submitted early are held in arrival order and flushed the moment the
//! ready confirmation lands. [`WsTransport`] is the production transport;
//! tests substitute an in-memory one.

pub mod fallback;

use crate::protocol::{AudioChunk, ClientMessage, InitRequest, ServerMessage, READY_MESSAGE};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Where the client currently is in the session exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session requested yet. Audio submitted now is held.
    Idle,
    /// `init` sent; waiting for the server's ready confirmation.
    Initializing,
    /// Session confirmed; audio goes straight out.
    Ready,
    /// The server reported a session failure. Held audio survives; a fresh
    /// [`SessionClient::init_session`] recovers.
    Error,
    /// The session ended, by `stop` or by the server's `done`. Terminal.
    Closed,
}

#[derive(Debug)]
pub enum ClientError {
    /// The transport could not deliver a message.
    Transport(String),
    /// `init_session` called while a previous init is still unconfirmed.
    AlreadyInitializing,
    /// The session already ended; connect again for a new one.
    SessionClosed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "Transport failure: {}", msg),
            ClientError::AlreadyInitializing => {
                write!(f, "Session initialization already in progress")
            }
            ClientError::SessionClosed => write!(f, "Session is closed"),
        }
    }
}

impl std::error::Error for ClientError {}

/// What happened to one submitted audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Delivered to the transport.
    Sent,
    /// Held locally until the server confirms the session.
    Queued,
    /// Dropped because the session is closed or errored.
    Rejected,
}

#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-way message sink toward the relay.
#[async_trait]
pub trait ClientTransport: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), TransportError>;
}

/// Callbacks invoked as server messages arrive. Every method defaults to a
/// no-op so a frontend implements only what it renders.
pub trait ClientEventHandler: Send {
    fn on_partial(&mut self, _text: &str, _detected_language: Option<&str>) {}
    fn on_final(&mut self, _text: &str, _detected_language: Option<&str>) {}
    fn on_status(&mut self, _message: &str) {}
    fn on_error(&mut self, _error: &str, _details: Option<&str>) {}
    fn on_done(&mut self) {}
}

/// Drives one relay session over a [`ClientTransport`].
///
/// The embedding frontend owns the receive loop: it reads server frames
/// (from [`connect_streaming`]'s receiver or its own plumbing) and feeds
/// each one to [`handle_server_message`](Self::handle_server_message), which
/// updates the state machine and fires the [`ClientEventHandler`].
pub struct SessionClient<T: ClientTransport, H: ClientEventHandler> {
    transport: T,
    handler: H,
    state: ClientState,
    pending: VecDeque<Vec<u8>>,
}

impl<T: ClientTransport, H: ClientEventHandler> SessionClient<T, H> {
    pub fn new(transport: T, handler: H) -> Self {
        Self {
            transport,
            handler,
            state: ClientState::Idle,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Number of chunks held back waiting for the ready confirmation.
    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// Requests a session with the given parameters.
    ///
    /// Valid from `Idle`, from `Ready` (replaces the running session), and
    /// from `Error` (recovery). Audio held in the queue stays there and
    /// flushes when the new session confirms.
    pub async fn init_session(&mut self, request: InitRequest) -> Result<(), ClientError> {
        match self.state {
            ClientState::Initializing => return Err(ClientError::AlreadyInitializing),
            ClientState::Closed => return Err(ClientError::SessionClosed),
            _ => {}
        }

        self.transport
            .send(ClientMessage::Init(request))
            .await
            .map_err(|e| {
                self.state = ClientState::Error;
                ClientError::Transport(e.0)
            })?;

        self.state = ClientState::Initializing;
        Ok(())
    }

    /// Hands one chunk of captured PCM to the session.
    ///
    /// Chunks never reorder: before the session is confirmed they queue in
    /// arrival order, and the queue drains ahead of any later chunk.
    pub async fn submit_audio_chunk(&mut self, pcm: Vec<u8>) -> SubmitOutcome {
        match self.state {
            ClientState::Ready => {
                if let Err(e) = self.send_chunk(&pcm).await {
                    warn!(error = %e, "Audio send failed; holding chunk for recovery");
                    self.pending.push_front(pcm);
                    self.state = ClientState::Error;
                    return SubmitOutcome::Queued;
                }
                SubmitOutcome::Sent
            }
            ClientState::Idle | ClientState::Initializing => {
                self.pending.push_back(pcm);
                SubmitOutcome::Queued
            }
            ClientState::Error | ClientState::Closed => SubmitOutcome::Rejected,
        }
    }

    /// Applies one server message to the state machine and fires the
    /// matching handler callback.
    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Status { message } => {
                if message == READY_MESSAGE && self.state == ClientState::Initializing {
                    self.state = ClientState::Ready;
                    self.flush_pending().await;
                }
                self.handler.on_status(&message);
            }
            ServerMessage::Transcription {
                text,
                detected_language,
            } => {
                self.handler.on_partial(&text, detected_language.as_deref());
            }
            ServerMessage::Final {
                text,
                detected_language,
            } => {
                self.handler.on_final(&text, detected_language.as_deref());
            }
            ServerMessage::Error { error, details } => {
                // Held audio survives so a re-init loses nothing.
                self.state = ClientState::Error;
                self.handler.on_error(&error, details.as_deref());
            }
            ServerMessage::Done => {
                self.state = ClientState::Closed;
                self.pending.clear();
                self.handler.on_done();
            }
            ServerMessage::Pong => {}
        }
    }

    /// Ends the session. Queued-but-unsent audio is discarded, not flushed.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        if self.state == ClientState::Closed {
            return Ok(());
        }
        self.pending.clear();
        let result = self.transport.send(ClientMessage::Stop).await;
        self.state = ClientState::Closed;
        result.map_err(|e| ClientError::Transport(e.0))
    }

    async fn send_chunk(&mut self, pcm: &[u8]) -> Result<(), TransportError> {
        let chunk = AudioChunk {
            data: BASE64.encode(pcm),
            format: None,
        };
        self.transport.send(ClientMessage::Audio(chunk)).await
    }

    async fn flush_pending(&mut self) {
        while let Some(pcm) = self.pending.pop_front() {
            if let Err(e) = self.send_chunk(&pcm).await {
                warn!(error = %e, "Flush interrupted; re-queueing chunk");
                self.pending.push_front(pcm);
                self.state = ClientState::Error;
                return;
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`ClientTransport`] over a live WebSocket connection to the relay.
pub struct WsTransport {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&mut self, message: ClientMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| TransportError(e.to_string()))?;
        self.sink
            .send(Message::Text(payload))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }
}

/// Dials the relay and splits the socket into a send half and a pumped
/// receive half.
///
/// A background task parses incoming text frames into [`ServerMessage`]s and
/// forwards them through the returned receiver. The receiver closes when the
/// socket does, however that happens, so `recv() == None` is the signal to
/// tear down or fall back.
pub async fn connect_streaming(
    url: &str,
    connect_timeout: Duration,
) -> Result<(WsTransport, mpsc::UnboundedReceiver<ServerMessage>), ClientError> {
    let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| ClientError::Transport(format!("Connection to {} timed out", url)))?
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let (sink, mut stream) = ws.split();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if message_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Discarding unparseable server frame"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Server closed the stream");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Stream read failed");
                    break;
                }
            }
        }
    });

    Ok((WsTransport { sink }, message_rx))
}
