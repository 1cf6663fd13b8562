//! Degraded-mode transcription endpoint.
//!
//! Clients that cannot hold a streaming WebSocket open record a clip
//! locally and POST it here instead. The upload is a WAV file that must
//! already be in the stream format (16 kHz mono 16-bit PCM by default);
//! the server validates the header and hands the raw samples to the engine
//! without re-encoding anything.

use crate::config::AudioConfig;
use crate::engine::RecognitionEngine;
use crate::error::{AppError, AppResult};
use crate::languages;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::io::Cursor;
use tracing::{debug, info};

/// ## Endpoint: `POST /transcribe`
///
/// Multipart form with a `file` field carrying the WAV clip and an optional
/// `language` text field. Responds with:
///
/// ```json
/// {
///   "success": true,
///   "text": "hello world",
///   "language": "en-US",
///   "language_probability": null
/// }
/// ```
pub async fn transcribe_upload(
    mut payload: Multipart,
    state: web::Data<AppState>,
    engine: web::Data<dyn RecognitionEngine>,
) -> AppResult<HttpResponse> {
    if !engine.is_configured() {
        return Err(AppError::Engine(
            "Speech service credentials are not configured".to_string(),
        ));
    }

    let config = state.get_config();
    let max_bytes = config.limits.max_upload_bytes;

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut language_field: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let field_name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|name| name.to_string())
            .ok_or_else(|| AppError::BadRequest("Missing multipart field name".to_string()))?;

        // Unknown fields are drained too; a multipart stream cannot be
        // skipped ahead.
        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("Upload interrupted: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::PayloadTooLarge(format!(
                    "Upload exceeds the configured limit of {} bytes",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        match field_name.as_str() {
            "file" => file_bytes = Some(bytes),
            "language" => {
                let value = String::from_utf8(bytes).map_err(|_| {
                    AppError::BadRequest("Language field is not valid UTF-8".to_string())
                })?;
                let value = value.trim().to_string();
                if !value.is_empty() && value != "auto" {
                    language_field = Some(value);
                }
            }
            other => debug!(field = %other, "Ignoring unknown multipart field"),
        }
    }

    let file_bytes =
        file_bytes.ok_or_else(|| AppError::BadRequest("Missing 'file' field in upload".to_string()))?;

    let language = match language_field {
        Some(code) => Some(
            languages::resolve(&code)
                .ok_or_else(|| {
                    AppError::ValidationError(format!("Unsupported language code: {}", code))
                })?
                .to_string(),
        ),
        None => None,
    };

    let pcm = extract_pcm(&file_bytes, &config.audio)?;
    info!(
        upload_bytes = file_bytes.len(),
        language = language.as_deref().unwrap_or("auto"),
        "Transcribing uploaded clip"
    );

    let result = engine.transcribe_once(pcm, language).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "text": result.text,
        "language": result.language,
        "language_probability": result.language_probability
    })))
}

/// Validates the WAV header against the stream format and returns the raw
/// little-endian PCM payload.
fn extract_pcm(bytes: &[u8], required: &AudioConfig) -> AppResult<Vec<u8>> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AppError::ValidationError(format!("Not a readable WAV file: {}", e)))?;

    if header.audio_format != wav::header::WAV_FORMAT_PCM {
        return Err(AppError::ValidationError(format!(
            "Only PCM WAV uploads are supported (format tag {})",
            header.audio_format
        )));
    }
    if header.channel_count != required.channels as u16 {
        return Err(AppError::ValidationError(format!(
            "Channel count mismatch: expected {}, got {}",
            required.channels, header.channel_count
        )));
    }
    if header.sampling_rate != required.sample_rate {
        return Err(AppError::ValidationError(format!(
            "Sample rate mismatch: expected {} Hz, got {} Hz",
            required.sample_rate, header.sampling_rate
        )));
    }
    if header.bits_per_sample != required.bits_per_sample as u16 {
        return Err(AppError::ValidationError(format!(
            "Bit depth mismatch: expected {}-bit, got {}-bit",
            required.bits_per_sample, header.bits_per_sample
        )));
    }

    let samples = match data {
        wav::BitDepth::Sixteen(samples) => samples,
        _ => {
            return Err(AppError::ValidationError(
                "Expected 16-bit PCM samples".to_string(),
            ))
        }
    };

    if samples.is_empty() {
        return Err(AppError::ValidationError(
            "Audio payload contains no samples".to_string(),
        ));
    }

    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(pcm)
}
