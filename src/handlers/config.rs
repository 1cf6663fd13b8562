//! Runtime configuration endpoints.

use crate::config::AppConfig;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Serializable view of the configuration. Credentials never leave the
/// process; only their presence is reported.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "speech": {
            "configured": config.speech.is_configured(),
            "initial_silence_timeout_ms": config.speech.initial_silence_timeout_ms,
            "end_silence_timeout_ms": config.speech.end_silence_timeout_ms
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bits_per_sample": config.audio.bits_per_sample,
            "encoding": config.audio.encoding
        },
        "limits": {
            "max_concurrent_sessions": config.limits.max_concurrent_sessions,
            "max_upload_bytes": config.limits.max_upload_bytes
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Applies a partial configuration document. Changes take effect for new
/// sessions; connections already streaming keep the settings they started
/// with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
