//! Error handling for the Echo core

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unauthorized (no API key supplied)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden (wrong API key)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Over capacity (speech queue full)
    #[error("Over capacity: {0}")]
    Capacity(String),

    /// Conflict (e.g. cancelling an utterance already playing)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Camera device error
    #[error("Device error: {0}")]
    Device(String),

    /// Speech synthesis or playback error
    #[error("Speech error: {0}")]
    Speech(String),

    /// State snapshot write error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            Error::Capacity(msg) => (StatusCode::TOO_MANY_REQUESTS, "OVER_CAPACITY", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::Device(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "DEVICE_ERROR",
                msg.clone(),
            ),
            Error::Speech(msg) => (StatusCode::BAD_GATEWAY, "SPEECH_ERROR", msg.clone()),
            Error::Persistence(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PERSISTENCE_ERROR",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                msg.clone(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
