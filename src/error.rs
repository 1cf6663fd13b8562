//! Error handling for the live translation backend.
//!
//! This module defines the application-wide error type and the mapping from
//! internal failures to HTTP responses. Every REST handler returns
//! `AppResult<T>`, and actix-web converts an `AppError` into a JSON error
//! envelope through the `ResponseError` implementation below.
//!
//! WebSocket sessions do not use this type on the wire; they report problems
//! through protocol-level `error` events instead (see `protocol::ServerMessage`).

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::engine::EngineError;

/// Application-wide error type.
///
/// Each variant corresponds to a class of failure with a distinct HTTP status
/// code. The inner `String` carries a human-readable description that is safe
/// to return to clients (no secrets, no internal paths).
#[derive(Debug)]
pub enum AppError {
    /// Unexpected internal failures (I/O, poisoned state, bugs). Maps to 500.
    Internal(String),

    /// Malformed request payloads, unparseable JSON or multipart data. Maps to 400.
    BadRequest(String),

    /// Unknown routes or missing resources. Maps to 404.
    NotFound(String),

    /// Configuration loading or validation failures. Maps to 500.
    ConfigError(String),

    /// Requests that parse correctly but violate a documented constraint,
    /// such as an unsupported language code or a WAV file with the wrong
    /// sample rate. Maps to 400.
    ValidationError(String),

    /// Uploads that exceed the configured size limit. Maps to 413.
    PayloadTooLarge(String),

    /// Failures reported by the speech recognition engine while serving a
    /// request, including connection and authentication problems. Maps to 502.
    Engine(String),

    /// The server is at its configured session capacity. Maps to 503.
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal server error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Engine(msg) => write!(f, "Speech engine error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    /// Converts the error into an HTTP response with a JSON body.
    ///
    /// The envelope shape is shared by every endpoint:
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "type": "validation_error",
    ///     "message": "Unsupported language code: xx-YY",
    ///     "timestamp": "2025-01-15T10:30:00Z"
    ///   }
    /// }
    /// ```
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::PayloadTooLarge(msg) => (
                actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                msg.clone(),
            ),
            AppError::Engine(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "engine_error",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err.to_string())
    }
}

/// Convenience alias used by all REST handlers.
pub type AppResult<T> = Result<T, AppError>;
