//! # Configuration Management
//!
//! Loads application configuration from multiple sources, later sources
//! overriding earlier ones:
//!
//! 1. Default values (built into the code)
//! 2. TOML configuration file (config.toml, optional)
//! 3. Environment variables with the APP_ prefix (APP_SERVER_HOST, ...)
//! 4. Deployment overrides: HOST, PORT, AZURE_SPEECH_KEY, AZURE_SPEECH_REGION
//!
//! Speech credentials deliberately default to empty strings. The server must
//! be able to start before secrets are provisioned; sessions opened without
//! credentials get a protocol-level error instead of a crashed process.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::protocol::AudioFormat;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Azure Speech service settings.
///
/// `key` and `region` normally arrive through the `AZURE_SPEECH_KEY` and
/// `AZURE_SPEECH_REGION` environment variables. The silence timeouts are
/// forwarded to the service when a recognition stream opens and control how
/// long the recognizer tolerates quiet audio before ending a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub key: String,
    pub region: String,
    pub initial_silence_timeout_ms: u32,
    pub end_silence_timeout_ms: u32,
}

impl SpeechConfig {
    /// True when both credential fields are non-empty.
    pub fn is_configured(&self) -> bool {
        !self.key.trim().is_empty() && !self.region.trim().is_empty()
    }
}

/// The audio format the recognition engine requires.
///
/// Clients capture and resample to exactly this format. Session setup rejects
/// any other declared format; the server never resamples on a client's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub encoding: String,
}

impl AudioConfig {
    /// Checks a client-declared format against the required one.
    ///
    /// Returns a description of the first mismatch, suitable for sending back
    /// to the client verbatim.
    pub fn check_declared(&self, declared: &AudioFormat) -> Result<(), String> {
        if declared.sample_rate != self.sample_rate {
            return Err(format!(
                "Sample rate mismatch: expected {}, got {}",
                self.sample_rate, declared.sample_rate
            ));
        }
        if declared.channels != self.channels {
            return Err(format!(
                "Channel count mismatch: expected {}, got {}",
                self.channels, declared.channels
            ));
        }
        if declared.bits_per_sample != self.bits_per_sample {
            return Err(format!(
                "Bit depth mismatch: expected {}, got {}",
                self.bits_per_sample, declared.bits_per_sample
            ));
        }
        if let Some(encoding) = &declared.encoding {
            if encoding != &self.encoding {
                return Err(format!(
                    "Encoding mismatch: expected {}, got {}",
                    self.encoding, encoding
                ));
            }
        }
        Ok(())
    }

    /// Bytes of PCM per second of audio at this format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// Operational limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneous WebSocket relay sessions.
    pub max_concurrent_sessions: usize,
    /// Maximum accepted body size for one-shot transcription uploads, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            speech: SpeechConfig {
                key: String::new(),
                region: String::new(),
                initial_silence_timeout_ms: 15000,
                end_silence_timeout_ms: 10000,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bits_per_sample: 16,
                encoding: "pcm_s16le".to_string(),
            },
            limits: LimitsConfig {
                max_concurrent_sessions: 10,
                max_upload_bytes: 25 * 1024 * 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// Missing files are fine; missing keys fall back to defaults. Only a
    /// malformed file or an unparseable value produces an error.
    ///
    /// ## Environment variable examples:
    /// - `APP_SERVER_PORT=3000`: override the listen port
    /// - `APP_SPEECH_REGION=westeurope`: override the service region
    /// - `AZURE_SPEECH_KEY=...`: credential injection used by deployments
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms and the Azure SDK ecosystem use these names
        // without the APP_ prefix, so they get explicit overrides.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("AZURE_SPEECH_KEY") {
            settings = settings.set_override("speech.key", key)?;
        }

        if let Ok(region) = env::var("AZURE_SPEECH_REGION") {
            settings = settings.set_override("speech.region", region)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Credentials may be empty here. The server starts without them and
    /// rejects session setup at runtime instead, so deployments can come up
    /// before secrets land.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!("Only mono audio is supported"));
        }

        if self.audio.bits_per_sample != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM audio is supported"));
        }

        if self.limits.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the document change. Speech credentials are
    /// excluded on purpose: secrets rotate through the environment, not the
    /// admin API.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(speech) = partial_config.get("speech") {
            if let Some(ms) = speech
                .get("initial_silence_timeout_ms")
                .and_then(|v| v.as_u64())
            {
                self.speech.initial_silence_timeout_ms = ms as u32;
            }
            if let Some(ms) = speech
                .get("end_silence_timeout_ms")
                .and_then(|v| v.as_u64())
            {
                self.speech.end_silence_timeout_ms = ms as u32;
            }
        }

        if let Some(limits) = partial_config.get("limits") {
            if let Some(sessions) = limits
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.limits.max_concurrent_sessions = sessions as usize;
            }
            if let Some(bytes) = limits.get("max_upload_bytes").and_then(|v| v.as_u64()) {
                self.limits.max_upload_bytes = bytes as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
