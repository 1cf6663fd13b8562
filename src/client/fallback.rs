//! Streaming-first connection establishment with HTTP fallback.
//!
//! The streaming WebSocket path gives live partials; the HTTP path only
//! transcribes whole recorded clips. They are not equivalent, so the rule
//! is strict: degraded mode is attempted only after the streaming attempt
//! has definitively failed, never concurrently and never preemptively.

use super::{connect_streaming, ClientError, WsTransport};
use crate::protocol::ServerMessage;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Endpoints the client needs to reach one relay deployment.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub ws_url: String,
    pub health_url: String,
    pub transcribe_url: String,
    pub connect_timeout: Duration,
}

impl FallbackConfig {
    /// Builds the three endpoint URLs from the relay's host and port, using
    /// its standard route table.
    pub fn for_server(host: &str, port: u16) -> Self {
        Self {
            ws_url: format!("ws://{}:{}/ws", host, port),
            health_url: format!("http://{}:{}/health", host, port),
            transcribe_url: format!("http://{}:{}/transcribe", host, port),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Which path [`establish`] ended up on.
pub enum Transport {
    /// Live WebSocket session; partials and finals stream back.
    Streaming(StreamingConnection),
    /// Clip-at-a-time HTTP transcription.
    Degraded(HttpFallback),
}

/// The two halves of an established streaming connection.
pub struct StreamingConnection {
    pub transport: WsTransport,
    pub messages: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Result of one attempt pair: which arm produced the value.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<A, B> {
    Primary(A),
    Secondary(B),
}

/// Both paths failed. Carries both failures because the second one alone
/// usually hides the interesting first one.
#[derive(Debug)]
pub struct FallbackError {
    pub primary: String,
    pub secondary: String,
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "streaming failed ({}); fallback failed ({})",
            self.primary, self.secondary
        )
    }
}

impl std::error::Error for FallbackError {}

/// Runs `primary` to completion; only if it fails, runs `secondary`.
///
/// The secondary future is not polled at all until the primary has failed,
/// so a fallback with side effects (a health probe, a connection) does
/// nothing on the happy path.
pub async fn try_primary_then_secondary<A, B, PF, SF>(
    primary: PF,
    secondary: SF,
) -> Result<Attempt<A, B>, FallbackError>
where
    PF: Future<Output = Result<A, String>>,
    SF: Future<Output = Result<B, String>>,
{
    let primary_err = match primary.await {
        Ok(value) => return Ok(Attempt::Primary(value)),
        Err(e) => e,
    };

    warn!(error = %primary_err, "Streaming path failed; trying degraded mode");

    match secondary.await {
        Ok(value) => Ok(Attempt::Secondary(value)),
        Err(secondary_err) => Err(FallbackError {
            primary: primary_err,
            secondary: secondary_err,
        }),
    }
}

/// Connects to the relay, preferring the streaming path.
///
/// Degraded mode requires a positive health probe first; a dead server
/// fails both arms and surfaces a [`FallbackError`].
pub async fn establish(config: &FallbackConfig) -> Result<Transport, FallbackError> {
    let streaming = async {
        connect_streaming(&config.ws_url, config.connect_timeout)
            .await
            .map(|(transport, messages)| StreamingConnection { transport, messages })
            .map_err(|e| e.to_string())
    };

    match try_primary_then_secondary(streaming, probe_degraded(config)).await? {
        Attempt::Primary(connection) => {
            info!(url = %config.ws_url, "Streaming connection established");
            Ok(Transport::Streaming(connection))
        }
        Attempt::Secondary(fallback) => {
            info!(url = %config.transcribe_url, "Running in degraded clip-upload mode");
            Ok(Transport::Degraded(fallback))
        }
    }
}

async fn probe_degraded(config: &FallbackConfig) -> Result<HttpFallback, String> {
    let client = reqwest::Client::builder()
        .timeout(config.connect_timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(&config.health_url)
        .send()
        .await
        .map_err(|e| format!("Health probe failed: {}", e))?;
    if !response.status().is_success() {
        return Err(format!("Health probe returned {}", response.status()));
    }

    Ok(HttpFallback {
        client,
        transcribe_url: config.transcribe_url.clone(),
    })
}

/// Clip-at-a-time transcription over the relay's HTTP endpoint.
pub struct HttpFallback {
    client: reqwest::Client,
    transcribe_url: String,
}

/// Response body of the relay's upload endpoint.
#[derive(Debug, Deserialize)]
pub struct FallbackTranscription {
    pub success: bool,
    pub text: String,
    pub language: Option<String>,
    pub language_probability: Option<f64>,
}

impl HttpFallback {
    /// Uploads one recorded WAV clip and returns its transcription.
    pub async fn transcribe_clip(
        &self,
        wav: Vec<u8>,
        language: Option<String>,
    ) -> Result<FallbackTranscription, ClientError> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("clip.wav")
            .mime_str("audio/wav")
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(language) = language {
            form = form.text("language", language);
        }

        let response = self
            .client
            .post(&self.transcribe_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "Transcription request failed: {} {}",
                status, body
            )));
        }

        response
            .json::<FallbackTranscription>()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}
