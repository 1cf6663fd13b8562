//! # Speech Recognition Engine Interface
//!
//! The relay never talks to a speech provider directly; it goes through the
//! traits in this module. `RecognitionEngine` opens streams and serves
//! one-shot requests, `EngineStream` accepts audio for an open stream, and
//! `EngineEventSink` receives recognition events as they happen.
//!
//! The sink is a trait with one method per event kind rather than a single
//! callback taking an event enum. Provider bindings call exactly the methods
//! they support, and test doubles override only what a scenario needs.

pub mod azure;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::AudioConfig;

/// How the recognizer should treat the spoken language.
#[derive(Debug, Clone)]
pub enum LanguageMode {
    /// Recognize exactly this locale.
    Exact(String),
    /// Identify the language continuously from this candidate list.
    AutoDetect(Vec<String>),
}

/// Everything a provider binding needs to open one recognition stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub language: LanguageMode,
    pub format: AudioConfig,
    pub initial_silence_timeout_ms: u32,
    pub end_silence_timeout_ms: u32,
}

/// Result of a one-shot (non-streaming) transcription.
#[derive(Debug, Clone)]
pub struct OneShotTranscription {
    pub text: String,
    pub language: Option<String>,
    pub language_probability: Option<f64>,
}

/// Receives recognition events from an open engine stream.
///
/// Implementations must be cheap and non-blocking; provider bindings call
/// these methods from their network read loops. The typical implementation
/// pushes onto an unbounded channel and returns.
pub trait EngineEventSink: Send + Sync {
    /// The service accepted the stream and recognition is live.
    fn session_started(&self);

    /// An interim hypothesis for the current utterance.
    fn partial(&self, text: String, detected_language: Option<String>);

    /// A finalized utterance.
    fn final_result(&self, text: String, detected_language: Option<String>);

    /// The service aborted the stream. The stream is dead after this.
    fn canceled(&self, error: EngineError);

    /// The service ended the stream cleanly (end of turn, end of audio).
    fn session_stopped(&self);
}

/// An open recognition stream accepting audio.
#[async_trait]
pub trait EngineStream: Send {
    /// Forwards one chunk of PCM audio to the service.
    async fn write_audio(&mut self, chunk: Vec<u8>) -> Result<(), EngineError>;

    /// Signals end of audio and releases the stream. Events already in
    /// flight may still arrive at the sink afterwards.
    async fn close(self: Box<Self>);
}

/// A speech recognition provider.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// True when credentials are present and streams can be opened.
    fn is_configured(&self) -> bool;

    /// Short provider label for health reporting.
    fn provider_name(&self) -> &'static str;

    /// Opens a streaming recognition session. Events flow to `sink` until
    /// the stream is closed or canceled.
    async fn open_stream(
        &self,
        settings: StreamSettings,
        sink: Arc<dyn EngineEventSink>,
    ) -> Result<Box<dyn EngineStream>, EngineError>;

    /// Transcribes a complete audio clip in one call. Used by the HTTP
    /// fallback endpoint; streaming sessions never go through here.
    async fn transcribe_once(
        &self,
        audio: Vec<u8>,
        language: Option<String>,
    ) -> Result<OneShotTranscription, EngineError>;
}

/// Classifies engine failures by how the relay should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Missing or rejected credentials. Not retryable; the operator must fix
    /// the deployment.
    Authentication,
    /// The request itself was invalid (unsupported format, bad parameters).
    Configuration,
    /// Momentary service-side failures: quota exhaustion, throttling,
    /// timeouts. Worth one automatic stream re-open.
    Transient,
    /// Everything else. The session reports it and shuts down.
    Fatal,
}

/// An error reported by a recognition engine.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Authentication,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Configuration,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// True for failures that justify one automatic stream re-open.
    pub fn is_transient(&self) -> bool {
        self.kind == EngineErrorKind::Transient
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EngineErrorKind::Authentication => "authentication",
            EngineErrorKind::Configuration => "configuration",
            EngineErrorKind::Transient => "transient",
            EngineErrorKind::Fatal => "fatal",
        };
        write!(f, "{} error: {}", kind, self.message)
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::transient("quota exceeded").is_transient());
        assert!(!EngineError::authentication("bad key").is_transient());
        assert!(!EngineError::fatal("connection lost").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::transient("quota exceeded");
        assert_eq!(err.to_string(), "transient error: quota exceeded");

        let err = EngineError::authentication("invalid subscription key");
        assert_eq!(
            err.to_string(),
            "authentication error: invalid subscription key"
        );
    }
}
