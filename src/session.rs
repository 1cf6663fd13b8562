//! Per-connection relay session.
//!
//! Each WebSocket connection owns exactly one [`RelaySession`], which runs as
//! a dedicated task consuming [`SessionCommand`]s from a single queue. Client
//! frames and engine callbacks both enter through that queue, so every
//! decision the session makes happens on one logical timeline: audio chunks
//! are forwarded in arrival order, and an engine event can never interleave
//! with a half-processed client command.
//!
//! The session survives engine-stream replacement. Streams are tagged with a
//! monotonically increasing epoch, and events from a torn-down stream are
//! discarded instead of corrupting the state machine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::engine::{
    EngineError, EngineEventSink, EngineStream, LanguageMode, RecognitionEngine, StreamSettings,
};
use crate::languages;
use crate::protocol::{InitRequest, ServerMessage};

/// Lifecycle of a relay session.
///
/// `Error` is recoverable from the client's point of view: a fresh `init`
/// starts over on the same connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Active,
    Error,
    Closed,
}

/// Everything the session task reacts to, client frames and engine callbacks
/// alike. Ordering within the queue is the ordering guarantee.
#[derive(Debug)]
pub enum SessionCommand {
    Init(InitRequest),
    Audio {
        data: Vec<u8>,
        declared_format: Option<String>,
    },
    Stop,
    Engine { epoch: u64, event: EngineEvent },
    ConnectionClosed,
}

/// Engine callbacks, re-materialized as queue items.
#[derive(Debug)]
pub enum EngineEvent {
    Started,
    Partial {
        text: String,
        detected_language: Option<String>,
    },
    Final {
        text: String,
        detected_language: Option<String>,
    },
    Canceled(EngineError),
    Stopped,
}

/// Sink handed to the engine. Tags every event with the epoch of the stream
/// it came from and pushes it onto the session queue. The weak sender keeps
/// a dangling engine reader from pinning the queue open after the connection
/// is gone.
struct ChannelSink {
    epoch: u64,
    events: mpsc::WeakUnboundedSender<SessionCommand>,
}

impl ChannelSink {
    fn push(&self, event: EngineEvent) {
        if let Some(tx) = self.events.upgrade() {
            let _ = tx.send(SessionCommand::Engine {
                epoch: self.epoch,
                event,
            });
        }
    }
}

impl EngineEventSink for ChannelSink {
    fn session_started(&self) {
        self.push(EngineEvent::Started);
    }

    fn partial(&self, text: String, detected_language: Option<String>) {
        self.push(EngineEvent::Partial {
            text,
            detected_language,
        });
    }

    fn final_result(&self, text: String, detected_language: Option<String>) {
        self.push(EngineEvent::Final {
            text,
            detected_language,
        });
    }

    fn canceled(&self, error: EngineError) {
        self.push(EngineEvent::Canceled(error));
    }

    fn session_stopped(&self) {
        self.push(EngineEvent::Stopped);
    }
}

enum Flow {
    Continue,
    Ended,
}

/// State machine bridging one client connection to the recognition engine.
pub struct RelaySession {
    connection_id: String,
    engine: Arc<dyn RecognitionEngine>,
    config: AppConfig,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::WeakUnboundedSender<SessionCommand>,
    state: SessionState,
    stream: Option<Box<dyn EngineStream>>,
    settings: Option<StreamSettings>,
    epoch: u64,
    /// One automatic re-open is allowed per fault. The budget is restored
    /// when a stream proves itself by reaching the started state, so a
    /// stream that dies before starting cannot loop.
    can_reopen: bool,
}

impl RelaySession {
    /// `events` must be the weak side of the same channel whose receiver is
    /// later passed to [`run`](Self::run); engine sinks send through it.
    pub fn new(
        connection_id: String,
        engine: Arc<dyn RecognitionEngine>,
        config: AppConfig,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        events: mpsc::WeakUnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            connection_id,
            engine,
            config,
            outbound,
            events,
            state: SessionState::Idle,
            stream: None,
            settings: None,
            epoch: 0,
            can_reopen: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consumes the command queue until the client stops, the connection
    /// closes, or every sender is gone. Always releases the engine stream
    /// before returning.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.recv().await {
            if matches!(self.apply(command).await, Flow::Ended) {
                break;
            }
        }
        self.shutdown().await;
        debug!(connection = %self.connection_id, "Relay session finished");
    }

    async fn apply(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Init(request) => {
                self.replace_session(request).await;
                Flow::Continue
            }
            SessionCommand::Audio {
                data,
                declared_format,
            } => {
                self.forward_audio(data, declared_format).await;
                Flow::Continue
            }
            SessionCommand::Engine { epoch, event } if epoch == self.epoch => {
                self.handle_engine_event(event).await;
                Flow::Continue
            }
            SessionCommand::Engine { epoch, .. } => {
                debug!(
                    connection = %self.connection_id,
                    stale_epoch = epoch,
                    "Discarding event from a replaced stream"
                );
                Flow::Continue
            }
            SessionCommand::Stop => {
                info!(connection = %self.connection_id, "Client requested stop");
                self.shutdown().await;
                self.send(ServerMessage::Done);
                Flow::Ended
            }
            SessionCommand::ConnectionClosed => {
                self.shutdown().await;
                Flow::Ended
            }
        }
    }

    /// Handles `init`, including re-init over a live session: the old stream
    /// is always torn down first, then the request is validated as if the
    /// session were fresh. Exactly one engine stream exists afterwards, or
    /// none if validation or the dial failed.
    async fn replace_session(&mut self, request: InitRequest) {
        self.epoch += 1;
        self.close_stream().await;

        if !self.engine.is_configured() {
            self.reject_init("Speech service credentials are not configured", None);
            return;
        }

        if let Some(declared) = &request.audio_config {
            if let Err(mismatch) = self.config.audio.check_declared(declared) {
                self.reject_init("Unsupported audio format", Some(mismatch));
                return;
            }
        }

        // An absent language means the same thing as the auto sentinel: let
        // the service identify what it hears.
        let language = match request.declared_language() {
            Some(code) if !request.wants_auto_detection() => match languages::resolve(code) {
                Some(locale) => LanguageMode::Exact(locale.to_string()),
                None => {
                    self.reject_init(
                        format!("Unsupported language code: {code}"),
                        Some(format!(
                            "supported codes: {}",
                            languages::supported_languages().join(", ")
                        )),
                    );
                    return;
                }
            },
            _ => LanguageMode::AutoDetect(
                languages::auto_detect_candidates()
                    .iter()
                    .map(|l| l.to_string())
                    .collect(),
            ),
        };

        let settings = StreamSettings {
            language,
            format: self.config.audio.clone(),
            initial_silence_timeout_ms: self.config.speech.initial_silence_timeout_ms,
            end_silence_timeout_ms: self.config.speech.end_silence_timeout_ms,
        };

        self.state = SessionState::Initializing;
        match self.open_stream_with(settings).await {
            Ok(()) => {
                self.can_reopen = true;
                info!(
                    connection = %self.connection_id,
                    provider = self.engine.provider_name(),
                    "Recognition stream opened"
                );
            }
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "Failed to open recognition stream");
                self.state = SessionState::Error;
                self.send(ServerMessage::error_with_details(
                    "Failed to start recognition session",
                    e.to_string(),
                ));
            }
        }
    }

    fn reject_init(&mut self, error: impl Into<String>, details: Option<String>) {
        let error = error.into();
        warn!(connection = %self.connection_id, error = %error, "Rejecting init");
        self.state = SessionState::Error;
        let message = match details {
            Some(details) => ServerMessage::error_with_details(error, details),
            None => ServerMessage::error(error),
        };
        self.send(message);
    }

    /// Forwards one chunk of audio to the open stream. A zero-length chunk is
    /// skipped: the engine treats an empty frame as end-of-audio, so it must
    /// never leak through from a client hiccup.
    async fn forward_audio(&mut self, data: Vec<u8>, declared_format: Option<String>) {
        if data.is_empty() {
            debug!(connection = %self.connection_id, "Skipping empty audio payload");
            return;
        }

        if let Some(declared) = declared_format {
            let expected = &self.config.audio.encoding;
            if !declared.eq_ignore_ascii_case(expected) {
                self.send(ServerMessage::error_with_details(
                    format!("Audio format mismatch: expected {expected}, got {declared}"),
                    "chunk dropped; session remains open",
                ));
                return;
            }
        }

        match self.state {
            SessionState::Initializing | SessionState::Active => {
                if let Some(stream) = self.stream.as_mut() {
                    if let Err(e) = stream.write_audio(data).await {
                        self.handle_engine_fault(e).await;
                    }
                } else {
                    debug!(connection = %self.connection_id, "No open stream; dropping audio");
                }
            }
            SessionState::Idle => {
                debug!(connection = %self.connection_id, "Audio before init; ignoring");
            }
            SessionState::Error | SessionState::Closed => {
                debug!(
                    connection = %self.connection_id,
                    state = ?self.state,
                    "Session not accepting audio"
                );
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Started => {
                self.can_reopen = true;
                if self.state == SessionState::Initializing {
                    self.state = SessionState::Active;
                    info!(connection = %self.connection_id, "Recognition session live");
                    self.send(ServerMessage::ready());
                } else {
                    debug!(connection = %self.connection_id, "Recognition stream restarted");
                }
            }
            EngineEvent::Partial {
                text,
                detected_language,
            } => {
                if matches!(self.state, SessionState::Initializing | SessionState::Active) {
                    self.send(ServerMessage::Transcription {
                        text,
                        detected_language,
                    });
                }
            }
            EngineEvent::Final {
                text,
                detected_language,
            } => {
                if text.trim().is_empty() {
                    debug!(connection = %self.connection_id, "Suppressing empty final");
                } else if matches!(self.state, SessionState::Initializing | SessionState::Active) {
                    self.send(ServerMessage::Final {
                        text,
                        detected_language,
                    });
                }
            }
            EngineEvent::Canceled(error) => {
                self.handle_engine_fault(error).await;
            }
            EngineEvent::Stopped => {
                if matches!(self.state, SessionState::Initializing | SessionState::Active) {
                    self.reopen_for_next_turn().await;
                } else {
                    debug!(connection = %self.connection_id, "Stream ended outside a live session");
                }
            }
        }
    }

    /// Single funnel for engine faults, whether they arrive as a canceled
    /// event or a failed write. Transient faults get one automatic re-open
    /// with the same settings; everything else surfaces to the client and
    /// parks the session in `Error` until a fresh init arrives.
    async fn handle_engine_fault(&mut self, error: EngineError) {
        // Bump first so anything still queued from the failed stream is
        // discarded rather than re-entering this funnel.
        self.epoch += 1;
        self.close_stream().await;

        if error.is_transient() && self.can_reopen {
            if let Some(settings) = self.settings.clone() {
                self.can_reopen = false;
                warn!(
                    connection = %self.connection_id,
                    error = %error,
                    "Transient engine fault; re-opening stream"
                );
                match self.open_stream_with(settings).await {
                    Ok(()) => {
                        debug!(connection = %self.connection_id, "Stream re-opened after fault");
                        return;
                    }
                    Err(reopen_err) => {
                        self.state = SessionState::Error;
                        self.send(ServerMessage::error_with_details(
                            error.message,
                            format!("automatic recovery failed: {reopen_err}"),
                        ));
                        return;
                    }
                }
            }
        }

        warn!(connection = %self.connection_id, error = %error, "Engine fault ends session");
        self.state = SessionState::Error;
        self.send(ServerMessage::error(error.message));
    }

    /// The service closed a turn cleanly while the client is still
    /// streaming. Recognition is continuous from the client's point of view,
    /// so open the next turn with the same settings.
    async fn reopen_for_next_turn(&mut self) {
        self.epoch += 1;
        self.close_stream().await;

        let Some(settings) = self.settings.clone() else {
            debug!(connection = %self.connection_id, "Turn ended with no settings recorded");
            return;
        };

        debug!(connection = %self.connection_id, "Turn ended; opening the next one");
        if let Err(e) = self.open_stream_with(settings).await {
            warn!(connection = %self.connection_id, error = %e, "Failed to open next turn");
            self.state = SessionState::Error;
            self.send(ServerMessage::error_with_details(
                "Recognition stream ended and could not be resumed",
                e.to_string(),
            ));
        }
    }

    async fn open_stream_with(&mut self, settings: StreamSettings) -> Result<(), EngineError> {
        self.epoch += 1;
        let sink = Arc::new(ChannelSink {
            epoch: self.epoch,
            events: self.events.clone(),
        });
        let stream = self.engine.open_stream(settings.clone(), sink).await?;
        self.stream = Some(stream);
        self.settings = Some(settings);
        Ok(())
    }

    async fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close().await;
        }
    }

    /// Idempotent teardown. Safe to call again after the loop exits.
    async fn shutdown(&mut self) {
        self.epoch += 1;
        self.close_stream().await;
        self.state = SessionState::Closed;
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection = %self.connection_id, "Connection gone; dropping outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OneShotTranscription;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    struct ScriptedEngine {
        configured: bool,
        fail_opens: Mutex<VecDeque<EngineError>>,
        opened_tx: mpsc::UnboundedSender<OpenedStream>,
    }

    impl ScriptedEngine {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedStream>) {
            let (opened_tx, opened_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(Self {
                configured: true,
                fail_opens: Mutex::new(VecDeque::new()),
                opened_tx,
            });
            (engine, opened_rx)
        }

        fn unconfigured() -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedStream>) {
            let (opened_tx, opened_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(Self {
                configured: false,
                fail_opens: Mutex::new(VecDeque::new()),
                opened_tx,
            });
            (engine, opened_rx)
        }

        fn fail_next_open(&self, error: EngineError) {
            self.fail_opens.lock().unwrap().push_back(error);
        }
    }

    /// Handle the test keeps for each stream the session opened.
    struct OpenedStream {
        settings: StreamSettings,
        sink: Arc<dyn EngineEventSink>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
        fail_next_write: Arc<Mutex<Option<EngineError>>>,
    }

    struct ScriptedStream {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
        fail_next_write: Arc<Mutex<Option<EngineError>>>,
    }

    #[async_trait]
    impl EngineStream for ScriptedStream {
        async fn write_audio(&mut self, chunk: Vec<u8>) -> Result<(), EngineError> {
            if let Some(err) = self.fail_next_write.lock().unwrap().take() {
                return Err(err);
            }
            self.written.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(self: Box<Self>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RecognitionEngine for ScriptedEngine {
        fn is_configured(&self) -> bool {
            self.configured
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        async fn open_stream(
            &self,
            settings: StreamSettings,
            sink: Arc<dyn EngineEventSink>,
        ) -> Result<Box<dyn EngineStream>, EngineError> {
            if let Some(err) = self.fail_opens.lock().unwrap().pop_front() {
                return Err(err);
            }
            let written = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let fail_next_write = Arc::new(Mutex::new(None));
            let _ = self.opened_tx.send(OpenedStream {
                settings,
                sink,
                written: written.clone(),
                closed: closed.clone(),
                fail_next_write: fail_next_write.clone(),
            });
            Ok(Box::new(ScriptedStream {
                written,
                closed,
                fail_next_write,
            }))
        }

        async fn transcribe_once(
            &self,
            _audio: Vec<u8>,
            _language: Option<String>,
        ) -> Result<OneShotTranscription, EngineError> {
            Err(EngineError::fatal("not exercised by these tests"))
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<SessionCommand>,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        opened: mpsc::UnboundedReceiver<OpenedStream>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn spawn(engine: Arc<ScriptedEngine>, opened: mpsc::UnboundedReceiver<OpenedStream>) -> Self {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let session = RelaySession::new(
                "test-conn".into(),
                engine,
                AppConfig::default(),
                outbound_tx,
                command_tx.downgrade(),
            );
            let task = tokio::spawn(session.run(command_rx));
            Self {
                commands: command_tx,
                outbound: outbound_rx,
                opened,
                task,
            }
        }

        fn init(&self, language: &str) {
            let request: InitRequest = serde_json::from_value(serde_json::json!({
                "language": language
            }))
            .unwrap();
            self.commands.send(SessionCommand::Init(request)).unwrap();
        }

        fn audio(&self, data: &[u8]) {
            self.commands
                .send(SessionCommand::Audio {
                    data: data.to_vec(),
                    declared_format: None,
                })
                .unwrap();
        }

        async fn next_stream(&mut self) -> OpenedStream {
            timeout(Duration::from_secs(1), self.opened.recv())
                .await
                .expect("engine stream should open")
                .expect("engine channel live")
        }

        async fn next_message(&mut self) -> ServerMessage {
            timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .expect("server message expected")
                .expect("outbound channel live")
        }

        async fn expect_silence(&mut self) {
            let quiet = timeout(Duration::from_millis(100), self.outbound.recv()).await;
            assert!(quiet.is_err(), "expected no outbound message");
        }

        async fn expect_no_stream(&mut self) {
            let quiet = timeout(Duration::from_millis(100), self.opened.recv()).await;
            assert!(quiet.is_err(), "expected no engine stream");
        }
    }

    fn is_ready(message: &ServerMessage) -> bool {
        matches!(message, ServerMessage::Status { message } if message == "ready")
    }

    #[tokio::test]
    async fn init_opens_stream_and_ready_follows_confirmation() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        match &stream.settings.language {
            LanguageMode::Exact(locale) => assert_eq!(locale, "en-US"),
            other => panic!("expected exact language, got {other:?}"),
        }

        // Not ready until the service confirms.
        h.expect_silence().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected_without_a_stream() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("zz-ZZ");
        match h.next_message().await {
            ServerMessage::Error { error, .. } => {
                assert!(error.contains("zz-ZZ"), "error should name the code: {error}")
            }
            other => panic!("expected error, got {other:?}"),
        }
        h.expect_no_stream().await;
    }

    #[tokio::test]
    async fn unconfigured_engine_rejects_init() {
        let (engine, opened) = ScriptedEngine::unconfigured();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        assert!(matches!(h.next_message().await, ServerMessage::Error { .. }));
        h.expect_no_stream().await;
    }

    #[tokio::test]
    async fn empty_audio_is_never_forwarded() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        h.audio(b"");
        h.audio(b"pcm-bytes");
        h.commands.send(SessionCommand::Stop).unwrap();
        assert!(matches!(h.next_message().await, ServerMessage::Done));

        let written = stream.written.lock().unwrap();
        assert_eq!(written.as_slice(), &[b"pcm-bytes".to_vec()]);
    }

    #[tokio::test]
    async fn second_init_replaces_the_stream_and_stale_events_are_dropped() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let first = h.next_stream().await;
        first.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        h.init("es");
        let second = h.next_stream().await;
        assert!(first.closed.load(Ordering::SeqCst), "old stream must be closed");
        match &second.settings.language {
            LanguageMode::Exact(locale) => assert_eq!(locale, "es-ES"),
            other => panic!("expected exact language, got {other:?}"),
        }

        // A late fatal from the replaced stream must not kill the new session.
        first.sink.canceled(EngineError::fatal("stale socket died"));
        h.expect_silence().await;

        second.sink.session_started();
        assert!(is_ready(&h.next_message().await));
    }

    #[tokio::test]
    async fn transient_fault_reopens_once_per_confirmed_stream() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let first = h.next_stream().await;
        first.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        // First fault: silently replaced.
        first.sink.canceled(EngineError::transient("quota exceeded"));
        let second = h.next_stream().await;
        h.expect_silence().await;

        // The replacement proves itself, restoring the budget.
        second.sink.session_started();
        second.sink.canceled(EngineError::transient("quota exceeded"));
        let third = h.next_stream().await;
        h.expect_silence().await;

        // The third stream dies before starting: budget exhausted, surface it.
        third.sink.canceled(EngineError::transient("quota exceeded"));
        match h.next_message().await {
            ServerMessage::Error { error, .. } => assert!(error.contains("quota")),
            other => panic!("expected error, got {other:?}"),
        }
        h.expect_no_stream().await;
    }

    #[tokio::test]
    async fn fatal_fault_surfaces_without_reopening() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        stream.sink.canceled(EngineError::authentication("key rejected"));
        match h.next_message().await {
            ServerMessage::Error { error, .. } => assert!(error.contains("key rejected")),
            other => panic!("expected error, got {other:?}"),
        }
        h.expect_no_stream().await;

        // Errored sessions ignore audio but accept a fresh init.
        h.audio(b"ignored");
        h.init("en");
        let replacement = h.next_stream().await;
        replacement.sink.session_started();
        assert!(is_ready(&h.next_message().await));
    }

    #[tokio::test]
    async fn failed_reopen_escalates_with_both_faults() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine.clone(), opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        engine.fail_next_open(EngineError::transient("still throttled"));
        stream.sink.canceled(EngineError::transient("quota exceeded"));
        match h.next_message().await {
            ServerMessage::Error { error, details } => {
                assert!(error.contains("quota exceeded"));
                assert!(details.unwrap().contains("still throttled"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_failure_routes_through_the_fault_funnel() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let first = h.next_stream().await;
        first.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        *first.fail_next_write.lock().unwrap() = Some(EngineError::transient("socket hiccup"));
        h.audio(b"chunk-1");

        // Replaced silently; later audio lands on the new stream.
        let second = h.next_stream().await;
        h.expect_silence().await;
        h.audio(b"chunk-2");
        h.commands.send(SessionCommand::Stop).unwrap();
        assert!(matches!(h.next_message().await, ServerMessage::Done));
        assert_eq!(
            second.written.lock().unwrap().as_slice(),
            &[b"chunk-2".to_vec()]
        );
    }

    #[tokio::test]
    async fn turn_end_opens_the_next_turn_seamlessly() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let first = h.next_stream().await;
        first.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        first.sink.session_stopped();
        let second = h.next_stream().await;
        h.expect_silence().await;

        h.audio(b"next-turn-audio");
        h.commands.send(SessionCommand::Stop).unwrap();
        assert!(matches!(h.next_message().await, ServerMessage::Done));
        assert_eq!(
            second.written.lock().unwrap().as_slice(),
            &[b"next-turn-audio".to_vec()]
        );
    }

    #[tokio::test]
    async fn chunk_format_mismatch_reports_but_keeps_the_session() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        h.commands
            .send(SessionCommand::Audio {
                data: b"opus-bytes".to_vec(),
                declared_format: Some("opus".into()),
            })
            .unwrap();
        match h.next_message().await {
            ServerMessage::Error { error, .. } => assert!(error.contains("format mismatch")),
            other => panic!("expected error, got {other:?}"),
        }

        h.audio(b"good-bytes");
        h.commands.send(SessionCommand::Stop).unwrap();
        assert!(matches!(h.next_message().await, ServerMessage::Done));
        assert_eq!(
            stream.written.lock().unwrap().as_slice(),
            &[b"good-bytes".to_vec()]
        );
    }

    #[tokio::test]
    async fn empty_finals_are_suppressed() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        stream.sink.final_result("   ".into(), None);
        h.expect_silence().await;

        stream.sink.final_result("hello world".into(), Some("en-US".into()));
        match h.next_message().await {
            ServerMessage::Final {
                text,
                detected_language,
            } => {
                assert_eq!(text, "hello world");
                assert_eq!(detected_language.as_deref(), Some("en-US"));
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_closes_the_stream_and_ends_the_task() {
        let (engine, opened) = ScriptedEngine::new();
        let mut h = Harness::spawn(engine, opened);

        h.init("en");
        let stream = h.next_stream().await;
        stream.sink.session_started();
        assert!(is_ready(&h.next_message().await));

        h.commands.send(SessionCommand::Stop).unwrap();
        assert!(matches!(h.next_message().await, ServerMessage::Done));
        timeout(Duration::from_secs(1), h.task)
            .await
            .expect("session task should finish")
            .unwrap();
        assert!(stream.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_every_sender_tears_the_session_down() {
        let (engine, opened) = ScriptedEngine::new();
        let Harness {
            commands,
            outbound: _outbound,
            mut opened,
            task,
        } = Harness::spawn(engine, opened);

        let request: InitRequest =
            serde_json::from_value(serde_json::json!({ "language": "en" })).unwrap();
        commands.send(SessionCommand::Init(request)).unwrap();
        let stream = timeout(Duration::from_secs(1), opened.recv())
            .await
            .unwrap()
            .unwrap();

        // Engine sinks hold only weak senders, so this is the last one.
        drop(commands);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("session task should finish")
            .unwrap();
        assert!(stream.closed.load(Ordering::SeqCst));
    }
}
