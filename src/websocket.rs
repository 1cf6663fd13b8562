//! WebSocket endpoint for live transcription relay.
//!
//! Each connection gets one actor and one [`RelaySession`] task. The actor
//! owns the socket: it decodes client frames into [`SessionCommand`]s, pushes
//! them onto the session's queue, and streams the session's outbound
//! [`ServerMessage`]s back as JSON text frames. All protocol decisions live
//! in the session; the actor is deliberately just a framing layer plus
//! connection liveness.
//!
//! Liveness runs on two levels. The actor pings with WebSocket control
//! frames on a fixed cadence and drops clients that stay silent past the
//! timeout. Browser clients, which cannot send control frames themselves,
//! may instead send JSON `ping` messages and get JSON `pong`s back; both
//! kinds refresh the same clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::RecognitionEngine;
use crate::error::AppError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{RelaySession, SessionCommand};
use crate::state::AppState;

/// Ping cadence, and the silence window after which a client is presumed gone.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Actor bridging one WebSocket connection to its relay session.
pub struct TranslateWebSocket {
    connection_id: String,
    app_state: web::Data<AppState>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Moved out in `started` when the session task is spawned.
    session: Option<(RelaySession, mpsc::UnboundedReceiver<SessionCommand>)>,
    /// Moved out in `started` and bridged into the actor as a stream.
    outbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    last_heartbeat: Instant,
}

impl TranslateWebSocket {
    pub fn new(app_state: web::Data<AppState>, engine: Arc<dyn RecognitionEngine>) -> Self {
        let connection_id = Uuid::new_v4().simple().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // The session holds only the weak side, so the channel dies with
        // this actor and the task cannot leak.
        let session = RelaySession::new(
            connection_id.clone(),
            engine,
            app_state.get_config(),
            outbound_tx,
            command_tx.downgrade(),
        );

        Self {
            connection_id,
            app_state,
            commands: command_tx,
            session: Some((session, command_rx)),
            outbound: Some(outbound_rx),
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, command: SessionCommand, ctx: &mut ws::WebsocketContext<Self>) {
        if self.commands.send(command).is_err() {
            // The session task has finished (explicit stop); the connection
            // has nothing left to say.
            debug!(connection = %self.connection_id, "Session ended; closing connection");
            ctx.close(Some(ws::CloseCode::Normal.into()));
            ctx.stop();
        }
    }

    /// Reports a framing-level problem directly; anything deeper goes
    /// through the session.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, error: &str, details: Option<String>) {
        warn!(connection = %self.connection_id, error = %error, "Client protocol error");
        let message = match details {
            Some(details) => ServerMessage::error_with_details(error, details),
            None => ServerMessage::error(error),
        };
        if let Ok(json) = serde_json::to_string(&message) {
            ctx.text(json);
        }
    }
}

impl Actor for TranslateWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "WebSocket connection established");

        if let Some((session, commands)) = self.session.take() {
            tokio::spawn(session.run(commands));
        }
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection = %act.connection_id, "Heartbeat timeout; closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // The session tears itself down when this lands (or, if the queue is
        // already gone, it has torn down on its own).
        let _ = self.commands.send(SessionCommand::ConnectionClosed);
        self.app_state.end_session();
        info!(connection = %self.connection_id, "WebSocket connection closed");
    }
}

/// Client frames in.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranslateWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Init(request)) => {
                    debug!(connection = %self.connection_id, "Init received");
                    self.forward(SessionCommand::Init(request), ctx);
                }
                Ok(ClientMessage::Audio(chunk)) => match BASE64.decode(chunk.data.as_bytes()) {
                    Ok(data) => self.forward(
                        SessionCommand::Audio {
                            data,
                            declared_format: chunk.format,
                        },
                        ctx,
                    ),
                    Err(e) => self.send_error(
                        ctx,
                        "Invalid audio payload",
                        Some(format!("base64 decode failed: {e}")),
                    ),
                },
                Ok(ClientMessage::Stop) => self.forward(SessionCommand::Stop, ctx),
                Ok(ClientMessage::Ping) => {
                    self.last_heartbeat = Instant::now();
                    if let Ok(json) = serde_json::to_string(&ServerMessage::Pong) {
                        ctx.text(json);
                    }
                }
                Ok(ClientMessage::Pong) => {
                    self.last_heartbeat = Instant::now();
                }
                Err(e) => self.send_error(ctx, "Malformed message", Some(e.to_string())),
            },
            Ok(ws::Message::Binary(data)) => {
                // Raw binary frames are audio with no per-chunk format tag.
                self.forward(
                    SessionCommand::Audio {
                        data: data.to_vec(),
                        declared_format: None,
                    },
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.connection_id, reason = ?reason, "Client closed connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.connection_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(connection = %self.connection_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Session messages out.
impl StreamHandler<ServerMessage> for TranslateWebSocket {
    fn handle(&mut self, message: ServerMessage, ctx: &mut Self::Context) {
        match serde_json::to_string(&message) {
            Ok(json) => ctx.text(json),
            Err(e) => {
                error!(connection = %self.connection_id, error = %e, "Failed to serialize server message")
            }
        }
    }

    /// The session task dropped its sender: the session is over, so the
    /// socket closes cleanly behind it.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(connection = %self.connection_id, "Relay session ended; closing socket");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// HTTP entry point upgrading to the relay protocol.
pub async fn translate_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    engine: web::Data<dyn RecognitionEngine>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .connection_info()
        .peer_addr()
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    if !app_state.try_begin_session() {
        warn!(peer = %peer, "Rejecting connection: session limit reached");
        return Err(AppError::ServiceUnavailable(
            "Maximum concurrent sessions reached; try again shortly".to_string(),
        )
        .into());
    }

    info!(peer = %peer, "New relay connection");
    let websocket = TranslateWebSocket::new(app_state.clone(), engine.into_inner());
    let response = ws::start(websocket, &req, stream);
    if response.is_err() {
        // The actor never started, so its stopped() hook cannot release the
        // slot claimed above.
        app_state.end_session();
    }
    response
}
