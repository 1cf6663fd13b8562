//! # Azure Speech-to-Text Binding
//!
//! Talks the Azure Speech WebSocket protocol directly. Each recognition
//! stream is one WebSocket connection carrying framed messages:
//!
//! - Text frames hold `\r\n`-separated headers (`Path`, `X-RequestId`,
//!   `X-Timestamp`, `Content-Type`), a blank line, then a JSON body.
//! - Binary frames carry audio: a big-endian u16 header-section length,
//!   the header section, then the payload bytes.
//!
//! Opening a stream sends `speech.config`, `speech.context`, and a WAV
//! header priming frame, after which raw PCM chunks flow as binary frames.
//! The service answers with `turn.start`, `speech.hypothesis`,
//! `speech.phrase`, and `turn.end` messages on the same socket. A zero-byte
//! audio frame marks end of input.
//!
//! One connection carries one turn. When the service ends the turn (trailing
//! silence or end of audio) the stream reports `session_stopped` and the
//! relay decides whether to open a fresh one.

use async_trait::async_trait;
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    EngineError, EngineEventSink, EngineStream, LanguageMode, OneShotTranscription,
    RecognitionEngine, StreamSettings,
};
use crate::config::{AudioConfig, SpeechConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Azure-assigned close code for throttled or quota-exhausted connections.
const CLOSE_CODE_QUOTA: u16 = 4429;

/// Azure Speech engine binding.
///
/// Stateless apart from its configuration; every `open_stream` call dials a
/// fresh WebSocket connection.
pub struct AzureSpeechEngine {
    key: String,
    region: String,
    format: AudioConfig,
    initial_silence_timeout_ms: u32,
    end_silence_timeout_ms: u32,
}

impl AzureSpeechEngine {
    pub fn new(speech: &SpeechConfig, audio: &AudioConfig) -> Self {
        Self {
            key: speech.key.trim().to_string(),
            region: speech.region.trim().to_string(),
            format: audio.clone(),
            initial_silence_timeout_ms: speech.initial_silence_timeout_ms,
            end_silence_timeout_ms: speech.end_silence_timeout_ms,
        }
    }

    /// Endpoint URL for a stream. Single-language recognition uses the
    /// conversation endpoint with an explicit `language` parameter; automatic
    /// detection uses the universal endpoint and passes candidates through
    /// `speech.context` instead.
    fn endpoint_url(&self, settings: &StreamSettings) -> String {
        match &settings.language {
            LanguageMode::Exact(code) => format!(
                "wss://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?format=simple&language={}",
                self.region, code
            ),
            LanguageMode::AutoDetect(_) => format!(
                "wss://{}.stt.speech.microsoft.com/speech/universal/v2?format=simple",
                self.region
            ),
        }
    }

    fn speech_config_body(&self) -> String {
        serde_json::json!({
            "context": {
                "system": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "build": "release",
                    "lang": "rust",
                },
                "os": {
                    "platform": std::env::consts::OS,
                    "name": std::env::consts::OS,
                    "version": "unknown",
                },
                "audio": {
                    "source": {
                        "type": "stream",
                        "samplerate": self.format.sample_rate,
                        "channelcount": self.format.channels,
                        "bitspersample": self.format.bits_per_sample,
                    }
                }
            }
        })
        .to_string()
    }

    fn speech_context_body(&self, settings: &StreamSettings) -> String {
        let mut context = serde_json::json!({
            "phraseDetection": {
                "initialSilenceTimeout": settings.initial_silence_timeout_ms,
                "trailingSilenceTimeout": settings.end_silence_timeout_ms,
            }
        });

        if let LanguageMode::AutoDetect(candidates) = &settings.language {
            context["languageId"] = serde_json::json!({
                "languages": candidates,
                "mode": "DetectContinuous",
                "onSuccess": { "action": "Recognize" },
                "onUnknown": { "action": "None" },
            });
        }

        context.to_string()
    }
}

#[async_trait]
impl RecognitionEngine for AzureSpeechEngine {
    fn is_configured(&self) -> bool {
        !self.key.is_empty() && !self.region.is_empty()
    }

    fn provider_name(&self) -> &'static str {
        "azure"
    }

    async fn open_stream(
        &self,
        settings: StreamSettings,
        sink: Arc<dyn EngineEventSink>,
    ) -> Result<Box<dyn EngineStream>, EngineError> {
        if !self.is_configured() {
            return Err(EngineError::authentication(
                "Azure Speech credentials are not configured",
            ));
        }

        let request_id = Uuid::new_v4().simple().to_string();
        let connection_id = Uuid::new_v4().simple().to_string();
        let url = self.endpoint_url(&settings);

        debug!(
            request_id = %request_id,
            language = ?settings.language,
            "Opening recognition stream"
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| EngineError::configuration(format!("invalid endpoint URL: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert(
            "Ocp-Apim-Subscription-Key",
            HeaderValue::from_str(&self.key).map_err(|_| {
                EngineError::configuration("subscription key contains invalid characters")
            })?,
        );
        headers.insert(
            "X-ConnectionId",
            HeaderValue::from_str(&connection_id)
                .map_err(|_| EngineError::configuration("invalid connection id"))?,
        );

        let (ws, _response) = connect_async(request).await.map_err(classify_connect_error)?;
        let (mut writer, reader) = ws.split();

        // Handshake: configuration, recognition context, then a WAV header
        // priming frame so the service knows the PCM layout.
        writer
            .send(Message::Text(text_frame(
                "speech.config",
                &request_id,
                JSON_CONTENT_TYPE,
                &self.speech_config_body(),
            )))
            .await
            .map_err(send_failed)?;
        writer
            .send(Message::Text(text_frame(
                "speech.context",
                &request_id,
                JSON_CONTENT_TYPE,
                &self.speech_context_body(&settings),
            )))
            .await
            .map_err(send_failed)?;
        let priming = audio_frame(&request_id, &wav_header(&self.format))
            .map_err(|e| EngineError::fatal(format!("failed to build audio frame: {}", e)))?;
        writer
            .send(Message::Binary(priming))
            .await
            .map_err(send_failed)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer, command_rx, request_id.clone()));
        tokio::spawn(run_reader(reader, sink, request_id));

        Ok(Box::new(AzureStream {
            commands: command_tx,
        }))
    }

    async fn transcribe_once(
        &self,
        audio: Vec<u8>,
        language: Option<String>,
    ) -> Result<OneShotTranscription, EngineError> {
        let settings = StreamSettings {
            language: match language {
                Some(code) => LanguageMode::Exact(code),
                None => LanguageMode::AutoDetect(
                    crate::languages::auto_detect_candidates()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            },
            format: self.format.clone(),
            initial_silence_timeout_ms: self.initial_silence_timeout_ms,
            end_silence_timeout_ms: self.end_silence_timeout_ms,
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CollectorSink { events: event_tx });

        let audio_seconds = audio.len() / self.format.bytes_per_second().max(1);
        let mut stream = self.open_stream(settings, sink).await?;

        // Feed the clip in one-second slices so frames stay well under the
        // service's message size ceiling.
        for chunk in audio.chunks(self.format.bytes_per_second().max(1)) {
            stream.write_audio(chunk.to_vec()).await?;
        }
        stream.close().await;

        // Recognition of a clip takes roughly real time plus service overhead.
        let deadline = std::time::Duration::from_secs(15 + audio_seconds as u64);
        let started = std::time::Instant::now();

        let mut parts: Vec<String> = Vec::new();
        let mut detected: Option<String> = None;
        let mut probability: Option<f64> = None;

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                if parts.is_empty() {
                    return Err(EngineError::transient("timed out waiting for transcription"));
                }
                break;
            }

            match tokio::time::timeout(remaining, event_rx.recv()).await {
                Ok(Some(CollectedEvent::Final { text, language, confidence })) => {
                    parts.push(text);
                    if language.is_some() {
                        detected = language;
                        probability = confidence;
                    }
                }
                Ok(Some(CollectedEvent::Canceled(err))) => {
                    if parts.is_empty() {
                        return Err(err);
                    }
                    warn!(error = %err, "Stream canceled after partial results; returning what we have");
                    break;
                }
                Ok(Some(CollectedEvent::Stopped)) | Ok(None) => break,
                Err(_) => {
                    if parts.is_empty() {
                        return Err(EngineError::transient("timed out waiting for transcription"));
                    }
                    break;
                }
            }
        }

        Ok(OneShotTranscription {
            text: parts.join(" "),
            language: detected,
            language_probability: probability,
        })
    }
}

/// Handle to an open Azure stream. Writes go through a channel to the writer
/// task so callers never block on the socket.
struct AzureStream {
    commands: mpsc::UnboundedSender<StreamCommand>,
}

enum StreamCommand {
    Audio(Vec<u8>),
    Close,
}

#[async_trait]
impl EngineStream for AzureStream {
    async fn write_audio(&mut self, chunk: Vec<u8>) -> Result<(), EngineError> {
        // The writer task exits when the socket drops; the classified close
        // reason follows through the event sink. A write that lands in that
        // window is retryable, and a re-open against a genuinely broken
        // service fails with the true classification.
        self.commands
            .send(StreamCommand::Audio(chunk))
            .map_err(|_| EngineError::transient("recognition stream is no longer writable"))
    }

    async fn close(self: Box<Self>) {
        let _ = self.commands.send(StreamCommand::Close);
    }
}

/// Events gathered for one-shot transcription.
enum CollectedEvent {
    Final {
        text: String,
        language: Option<String>,
        confidence: Option<f64>,
    },
    Canceled(EngineError),
    Stopped,
}

struct CollectorSink {
    events: mpsc::UnboundedSender<CollectedEvent>,
}

impl EngineEventSink for CollectorSink {
    fn session_started(&self) {}

    fn partial(&self, _text: String, _detected_language: Option<String>) {}

    fn final_result(&self, text: String, detected_language: Option<String>) {
        let _ = self.events.send(CollectedEvent::Final {
            text,
            language: detected_language,
            confidence: None,
        });
    }

    fn canceled(&self, error: EngineError) {
        let _ = self.events.send(CollectedEvent::Canceled(error));
    }

    fn session_stopped(&self) {
        let _ = self.events.send(CollectedEvent::Stopped);
    }
}

/// Sends queued audio frames until the stream closes.
async fn run_writer(
    mut writer: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    request_id: String,
) {
    while let Some(command) = commands.recv().await {
        match command {
            StreamCommand::Audio(chunk) => {
                let frame = match audio_frame(&request_id, &chunk) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Failed to build audio frame");
                        break;
                    }
                };
                if let Err(e) = writer.send(Message::Binary(frame)).await {
                    debug!(request_id = %request_id, error = %e, "Audio write failed; stopping writer");
                    break;
                }
            }
            StreamCommand::Close => break,
        }
    }

    // End-of-audio marker, then a protocol close. Failures here mean the
    // socket is already gone, which the reader task reports.
    if let Ok(frame) = audio_frame(&request_id, &[]) {
        let _ = writer.send(Message::Binary(frame)).await;
    }
    let _ = writer.send(Message::Close(None)).await;
}

/// Parses service frames and feeds the event sink until the socket ends.
async fn run_reader(
    mut reader: SplitStream<WsStream>,
    sink: Arc<dyn EngineEventSink>,
    request_id: String,
) {
    let mut terminal = false;
    let mut failure: Option<EngineError> = None;

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(raw)) => {
                let Some((path, body)) = parse_service_message(&raw) else {
                    warn!(request_id = %request_id, "Unparseable service frame");
                    continue;
                };

                match path.as_str() {
                    "turn.start" => sink.session_started(),
                    "speech.startDetected" | "speech.endDetected" => {}
                    "speech.hypothesis" | "speech.fragment" => {
                        if let Ok(payload) = serde_json::from_str::<HypothesisPayload>(body) {
                            if !payload.text.trim().is_empty() {
                                sink.partial(
                                    payload.text,
                                    payload.primary_language.map(|l| l.language),
                                );
                            }
                        }
                    }
                    "speech.phrase" => match serde_json::from_str::<PhrasePayload>(body) {
                        Ok(payload) => match payload.recognition_status.as_str() {
                            "Success" => {
                                let text = payload.display_text.unwrap_or_default();
                                if !text.trim().is_empty() {
                                    sink.final_result(
                                        text,
                                        payload.primary_language.map(|l| l.language),
                                    );
                                }
                            }
                            "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => {
                                debug!(
                                    request_id = %request_id,
                                    status = %payload.recognition_status,
                                    "Phrase without usable speech"
                                );
                            }
                            "Error" => {
                                failure = Some(EngineError::fatal("service reported a recognition error"));
                                break;
                            }
                            other => {
                                debug!(request_id = %request_id, status = %other, "Unhandled phrase status");
                            }
                        },
                        Err(e) => {
                            warn!(request_id = %request_id, error = %e, "Malformed speech.phrase payload");
                        }
                    },
                    "turn.end" => {
                        sink.session_stopped();
                        terminal = true;
                        break;
                    }
                    other => {
                        debug!(request_id = %request_id, path = %other, "Ignoring service message");
                    }
                }
            }
            Ok(Message::Close(close_frame)) => {
                failure = Some(match close_frame {
                    Some(cf) => classify_close(u16::from(cf.code), &cf.reason),
                    None => EngineError::fatal("service closed the stream without a reason"),
                });
                break;
            }
            Ok(_) => {}
            Err(e) => {
                failure = Some(classify_message(&e.to_string()));
                break;
            }
        }
    }

    if !terminal {
        let error = failure
            .unwrap_or_else(|| EngineError::fatal("recognition stream ended unexpectedly"));
        sink.canceled(error);
    }
}

/// Builds a client-to-service text frame.
fn text_frame(path: &str, request_id: &str, content_type: &str, body: &str) -> String {
    format!(
        "Path: {}\r\nX-RequestId: {}\r\nX-Timestamp: {}\r\nContent-Type: {}\r\n\r\n{}",
        path,
        request_id,
        timestamp(),
        content_type,
        body
    )
}

/// Builds a binary audio frame: u16 big-endian header length, headers, payload.
/// An empty payload marks end of audio.
fn audio_frame(request_id: &str, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let headers = format!(
        "Path: audio\r\nX-RequestId: {}\r\nX-Timestamp: {}\r\nContent-Type: audio/x-wav",
        request_id,
        timestamp()
    );
    let header_bytes = headers.as_bytes();

    let mut frame = Vec::with_capacity(2 + header_bytes.len() + payload.len());
    frame.write_u16::<BigEndian>(header_bytes.len() as u16)?;
    frame.extend_from_slice(header_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// 44-byte RIFF/WAVE header describing the PCM stream. Length fields are
/// zeroed; the service treats the stream as open-ended.
fn wav_header(format: &AudioConfig) -> Vec<u8> {
    let byte_rate =
        format.sample_rate * format.channels as u32 * (format.bits_per_sample as u32 / 8);
    let block_align = format.channels as u16 * (format.bits_per_sample as u16 / 8);

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    let _ = header.write_u32::<LittleEndian>(0);
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    let _ = header.write_u32::<LittleEndian>(16);
    let _ = header.write_u16::<LittleEndian>(1); // PCM
    let _ = header.write_u16::<LittleEndian>(format.channels as u16);
    let _ = header.write_u32::<LittleEndian>(format.sample_rate);
    let _ = header.write_u32::<LittleEndian>(byte_rate);
    let _ = header.write_u16::<LittleEndian>(block_align);
    let _ = header.write_u16::<LittleEndian>(format.bits_per_sample as u16);
    header.extend_from_slice(b"data");
    let _ = header.write_u32::<LittleEndian>(0);
    header
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Splits a service text frame into its `Path` header and JSON body.
fn parse_service_message(raw: &str) -> Option<(String, &str)> {
    let (head, body) = raw.split_once("\r\n\r\n")?;
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("path") {
                return Some((value.trim().to_string(), body));
            }
        }
    }
    None
}

fn send_failed(err: tungstenite::Error) -> EngineError {
    EngineError::fatal(format!("failed to send handshake frame: {}", err))
}

fn classify_connect_error(err: tungstenite::Error) -> EngineError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                401 | 403 => EngineError::authentication(format!(
                    "service rejected credentials (HTTP {})",
                    status
                )),
                429 => EngineError::transient("service throttled the connection (HTTP 429)"),
                _ => EngineError::fatal(format!("connection rejected with HTTP {}", status)),
            }
        }
        tungstenite::Error::Io(e) => {
            EngineError::transient(format!("connection failed: {}", e))
        }
        other => EngineError::fatal(format!("connection failed: {}", other)),
    }
}

/// Maps a close code plus reason text onto an error class.
fn classify_close(code: u16, reason: &str) -> EngineError {
    let detail = if reason.is_empty() {
        format!("service closed the stream (code {})", code)
    } else {
        format!("service closed the stream (code {}): {}", code, reason)
    };

    match code {
        CLOSE_CODE_QUOTA => EngineError::transient(detail),
        4401 | 4403 => EngineError::authentication(detail),
        1007 | 4400 => EngineError::configuration(detail),
        _ => classify_message(&detail),
    }
}

/// Keyword-based classification for errors that arrive as plain text.
fn classify_message(message: &str) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("quota")
        || lower.contains("throttl")
        || lower.contains("429")
        || lower.contains("timeout")
        || lower.contains("timed out")
    {
        EngineError::transient(message)
    } else if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("subscription")
    {
        EngineError::authentication(message)
    } else {
        EngineError::fatal(message)
    }
}

/// Interim hypothesis payload (`speech.hypothesis`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HypothesisPayload {
    text: String,
    #[serde(default)]
    primary_language: Option<PrimaryLanguage>,
}

/// Final phrase payload (`speech.phrase`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhrasePayload {
    recognition_status: String,
    #[serde(default)]
    display_text: Option<String>,
    #[serde(default)]
    primary_language: Option<PrimaryLanguage>,
}

/// Language identification attached to hypotheses and phrases.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PrimaryLanguage {
    language: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineErrorKind;

    fn test_format() -> AudioConfig {
        AudioConfig {
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 16,
            encoding: "pcm_s16le".to_string(),
        }
    }

    #[test]
    fn test_text_frame_layout() {
        let frame = text_frame("speech.config", "abc123", JSON_CONTENT_TYPE, "{}");
        assert!(frame.starts_with("Path: speech.config\r\n"));
        assert!(frame.contains("X-RequestId: abc123\r\n"));
        assert!(frame.contains("\r\n\r\n{}"));
    }

    #[test]
    fn test_audio_frame_prefix() {
        let frame = audio_frame("abc123", &[1, 2, 3, 4]).unwrap();
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let headers = std::str::from_utf8(&frame[2..2 + header_len]).unwrap();
        assert!(headers.starts_with("Path: audio\r\n"));
        assert!(headers.contains("X-RequestId: abc123"));
        assert_eq!(&frame[2 + header_len..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_end_of_audio_frame_has_no_payload() {
        let frame = audio_frame("abc123", &[]).unwrap();
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(frame.len(), 2 + header_len);
    }

    #[test]
    fn test_wav_header_layout() {
        let header = wav_header(&test_format());
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        // Sample rate at offset 24, little-endian.
        assert_eq!(
            u32::from_le_bytes([header[24], header[25], header[26], header[27]]),
            16000
        );
        // Byte rate at offset 28: 16000 * 1 * 2.
        assert_eq!(
            u32::from_le_bytes([header[28], header[29], header[30], header[31]]),
            32000
        );
    }

    #[test]
    fn test_parse_service_message() {
        let raw = "X-RequestId: abc\r\nPath: speech.phrase\r\nContent-Type: application/json\r\n\r\n{\"RecognitionStatus\":\"Success\"}";
        let (path, body) = parse_service_message(raw).unwrap();
        assert_eq!(path, "speech.phrase");
        assert_eq!(body, "{\"RecognitionStatus\":\"Success\"}");

        assert!(parse_service_message("no blank line here").is_none());
    }

    #[test]
    fn test_phrase_payload_parsing() {
        let body = r#"{
            "RecognitionStatus": "Success",
            "DisplayText": "hello world",
            "Offset": 100000,
            "Duration": 12500000,
            "PrimaryLanguage": {"Language": "en-US"}
        }"#;
        let payload: PhrasePayload = serde_json::from_str(body).unwrap();
        assert_eq!(payload.recognition_status, "Success");
        assert_eq!(payload.display_text.as_deref(), Some("hello world"));
        assert_eq!(
            payload.primary_language.map(|l| l.language).as_deref(),
            Some("en-US")
        );

        // NoMatch phrases carry no DisplayText.
        let payload: PhrasePayload =
            serde_json::from_str(r#"{"RecognitionStatus": "NoMatch"}"#).unwrap();
        assert!(payload.display_text.is_none());
    }

    #[test]
    fn test_close_code_classification() {
        assert_eq!(
            classify_close(CLOSE_CODE_QUOTA, "quota exceeded").kind,
            EngineErrorKind::Transient
        );
        assert_eq!(
            classify_close(4401, "unauthorized").kind,
            EngineErrorKind::Authentication
        );
        assert_eq!(
            classify_close(1007, "invalid payload").kind,
            EngineErrorKind::Configuration
        );
        assert_eq!(
            classify_close(1011, "internal error").kind,
            EngineErrorKind::Fatal
        );
    }

    #[test]
    fn test_message_classification() {
        assert!(classify_message("Quota exceeded for this hour").is_transient());
        assert!(classify_message("connection timed out").is_transient());
        assert_eq!(
            classify_message("WebSocket upgrade failed: 401 Unauthorized").kind,
            EngineErrorKind::Authentication
        );
        assert_eq!(
            classify_message("something broke").kind,
            EngineErrorKind::Fatal
        );
    }

    #[tokio::test]
    async fn test_write_after_writer_exit_is_transient() {
        // Losing the writer is how a dropped socket first shows up on the
        // write path; the true close reason arrives through the sink, so
        // this failure must leave the re-open path available.
        let (commands, receiver) = mpsc::unbounded_channel();
        drop(receiver);

        let mut stream = AzureStream { commands };
        let err = stream.write_audio(vec![1, 2]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_endpoint_url_by_language_mode() {
        let speech = SpeechConfig {
            key: "k".to_string(),
            region: "eastus".to_string(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        };
        let engine = AzureSpeechEngine::new(&speech, &test_format());

        let exact = engine.endpoint_url(&StreamSettings {
            language: LanguageMode::Exact("ar-SA".to_string()),
            format: test_format(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        });
        assert!(exact.starts_with("wss://eastus.stt.speech.microsoft.com/speech/recognition/conversation/"));
        assert!(exact.contains("language=ar-SA"));

        let auto = engine.endpoint_url(&StreamSettings {
            language: LanguageMode::AutoDetect(vec!["en-US".to_string()]),
            format: test_format(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        });
        assert!(auto.contains("/speech/universal/v2"));
        assert!(!auto.contains("language="));
    }

    #[test]
    fn test_unconfigured_engine_reports_not_ready() {
        let speech = SpeechConfig {
            key: String::new(),
            region: String::new(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        };
        let engine = AzureSpeechEngine::new(&speech, &test_format());
        assert!(!engine.is_configured());
    }

    #[test]
    fn test_speech_context_includes_language_candidates() {
        let speech = SpeechConfig {
            key: "k".to_string(),
            region: "eastus".to_string(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        };
        let engine = AzureSpeechEngine::new(&speech, &test_format());

        let body = engine.speech_context_body(&StreamSettings {
            language: LanguageMode::AutoDetect(vec!["en-US".to_string(), "ar-SA".to_string()]),
            format: test_format(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        });
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["languageId"]["languages"][0], "en-US");
        assert_eq!(value["languageId"]["mode"], "DetectContinuous");
        assert_eq!(value["phraseDetection"]["initialSilenceTimeout"], 15000);

        let body = engine.speech_context_body(&StreamSettings {
            language: LanguageMode::Exact("ar-SA".to_string()),
            format: test_format(),
            initial_silence_timeout_ms: 15000,
            end_silence_timeout_ms: 10000,
        });
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(value.get("languageId").is_none());
    }
}
