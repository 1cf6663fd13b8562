//! WebSocket wire protocol between clients and the relay.
//!
//! All control messages are JSON text frames tagged with a `type` field.
//! Audio travels either as a base64 payload inside an `audio` message or as a
//! raw binary frame; both paths feed the same relay session.
//!
//! Field names follow the JavaScript client convention (camelCase) because
//! browser and Electron capture clients predate this server.

use serde::{Deserialize, Serialize};

/// Status message text that tells clients the session is ready for audio.
pub const READY_MESSAGE: &str = "ready";

/// Messages a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Configures a new relay session. A second `init` on the same connection
    /// tears down the old session and starts over.
    Init(InitRequest),

    /// One chunk of captured audio, base64-encoded.
    Audio(AudioChunk),

    /// Ends the session. Anything queued but unsent on the client side is
    /// discarded by this call, not flushed.
    Stop,

    /// Application-level liveness probe. Browser clients cannot emit
    /// WebSocket control frames, so they probe with JSON instead.
    Ping,

    /// Answer to a server-side JSON `ping`.
    Pong,
}

/// Session setup parameters carried by an `init` message.
///
/// Language selection works through three fields for historical reasons:
/// `sourceLanguage` is the explicit spoken-language override, `language` is
/// the older combined field (the literal `"auto"` requests detection), and
/// `autoDetection` forces detection regardless of the other two. When both
/// `sourceLanguage` and `language` carry a concrete code, `sourceLanguage`
/// wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub language: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    #[serde(default)]
    pub auto_detection: bool,
    pub audio_config: Option<AudioFormat>,
}

impl InitRequest {
    /// True when the client asked for automatic language identification.
    pub fn wants_auto_detection(&self) -> bool {
        self.auto_detection
            || self.language.as_deref() == Some("auto")
            || self.source_language.as_deref() == Some("auto")
    }

    /// The spoken-language code the client declared, if any.
    /// `sourceLanguage` takes precedence over `language`.
    pub fn declared_language(&self) -> Option<&str> {
        self.source_language
            .as_deref()
            .filter(|l| *l != "auto")
            .or_else(|| self.language.as_deref().filter(|l| *l != "auto"))
    }
}

/// Declared format of the audio a client will send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 16,
            encoding: Some("pcm_s16le".to_string()),
        }
    }
}

/// Base64 audio payload with an optional per-chunk format tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Messages the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Lifecycle notices. `message == "ready"` means the recognition stream
    /// is live and audio will be forwarded from now on.
    Status { message: String },

    /// An interim hypothesis. Superseded by later transcriptions and by the
    /// next `final`.
    Transcription {
        text: String,
        #[serde(
            rename = "detectedLanguage",
            skip_serializing_if = "Option::is_none"
        )]
        detected_language: Option<String>,
    },

    /// A finalized utterance. Never empty; silent turns produce nothing.
    Final {
        text: String,
        #[serde(
            rename = "detectedLanguage",
            skip_serializing_if = "Option::is_none"
        )]
        detected_language: Option<String>,
    },

    /// A session-level failure report.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// Clean end of the session.
    Done,

    /// Answer to a client-side JSON `ping`.
    Pong,
}

impl ServerMessage {
    pub fn ready() -> Self {
        ServerMessage::Status {
            message: READY_MESSAGE.to_string(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            details: None,
        }
    }

    pub fn error_with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_message_parsing() {
        // The shape browser capture clients actually send.
        let json = r#"{
            "type": "init",
            "language": "auto",
            "targetLanguage": "en",
            "autoDetection": true,
            "audioConfig": {
                "sampleRate": 16000,
                "channels": 1,
                "bitsPerSample": 16,
                "encoding": "pcm_s16le"
            }
        }"#;

        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Init(init) => {
                assert!(init.wants_auto_detection());
                assert_eq!(init.declared_language(), None);
                assert_eq!(init.target_language.as_deref(), Some("en"));
                let format = init.audio_config.unwrap();
                assert_eq!(format.sample_rate, 16000);
                assert_eq!(format.encoding.as_deref(), Some("pcm_s16le"));
            }
            other => panic!("expected init, got {:?}", other),
        }
    }

    #[test]
    fn test_source_language_precedence() {
        let json = r#"{
            "type": "init",
            "language": "en-US",
            "sourceLanguage": "ar-SA",
            "targetLanguage": "en"
        }"#;

        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Init(init) => {
                assert_eq!(init.declared_language(), Some("ar-SA"));
                assert!(!init.wants_auto_detection());
            }
            other => panic!("expected init, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_init() {
        // Older clients send only a language.
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "init", "language": "ar-SA"}"#).unwrap();
        match msg {
            ClientMessage::Init(init) => {
                assert_eq!(init.declared_language(), Some("ar-SA"));
                assert!(init.audio_config.is_none());
            }
            other => panic!("expected init, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_and_stop_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "audio", "data": "AAAA"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Audio(ref c) if c.data == "AAAA"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "stop"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Stop));
    }

    #[test]
    fn test_json_heartbeat_round_trip() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_server_message_shapes() {
        let json = serde_json::to_string(&ServerMessage::ready()).unwrap();
        assert_eq!(json, r#"{"type":"status","message":"ready"}"#);

        let json = serde_json::to_string(&ServerMessage::Final {
            text: "hello".to_string(),
            detected_language: Some("en-US".to_string()),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"final","text":"hello","detectedLanguage":"en-US"}"#
        );

        // Optional fields disappear instead of serializing null.
        let json = serde_json::to_string(&ServerMessage::Transcription {
            text: "partial".to_string(),
            detected_language: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"transcription","text":"partial"}"#);

        let json = serde_json::to_string(&ServerMessage::Done).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type": "bogus", "data": "x"}"#);
        assert!(result.is_err());
    }
}
