//! # Error Handling
//!
//! HTTP-facing error type and its conversion into JSON error responses.
//!
//! ## Two Layers of Errors:
//! - **AudioError** (`crate::audio::error`): What went wrong inside the audio,
//!   answer and provider code. Derived with `thiserror`, cloneable, no HTTP knowledge
//! - **AppError** (this module): What the API client is told. Every handler
//!   returns `AppResult<T>` and `?` converts the lower layers through `From`
//!
//! ## Key Rust Concepts:
//! - **From trait**: `?` calls `From::from` on the error, so handlers never map
//!   errors by hand
//! - **ResponseError trait**: actix-web turns an `Err(AppError)` into an HTTP response

use crate::audio::AudioError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **Unauthorized**: A verified user is required (401)
/// - **NotFound**: Requested resource doesn't exist (404)
/// - **Conflict**: Request clashes with current state, e.g. session already running (409)
/// - **TooManySessions**: Voice session limit reached (503)
/// - **Upstream**: The AI provider failed or is unreachable (502)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Data validation failed (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    TooManySessions(String),
    Upstream(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::TooManySessions(msg) => write!(f, "Too many sessions: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    /// Status code and machine-readable type for each variant.
    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::TooManySessions(_) => (StatusCode::SERVICE_UNAVAILABLE, "too_many_sessions"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::TooManySessions(msg)
            | AppError::Upstream(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg) => msg,
        }
    }
}

/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "upstream_error",
///     "message": "fetch failed: HTTP 429: quota exceeded",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.kind();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Maps the audio taxonomy onto HTTP semantics.
///
/// ## Mapping:
/// - AuthRequired → 401
/// - FetchFailed / ConnectionFailed → 502 (the provider is at fault)
/// - SessionAlreadyActive → 409
/// - DecodeFailed / MicrophoneUnavailable / OutputClosed → 500
impl From<AudioError> for AppError {
    fn from(err: AudioError) -> Self {
        let message = err.to_string();
        match err {
            AudioError::AuthRequired => AppError::Unauthorized(message),
            AudioError::FetchFailed(_) | AudioError::ConnectionFailed(_) => AppError::Upstream(message),
            AudioError::SessionAlreadyActive => AppError::Conflict(message),
            AudioError::DecodeFailed(_)
            | AudioError::MicrophoneUnavailable(_)
            | AudioError::OutputClosed => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they become 400s.
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

pub type AppResult<T> = Result<T, AppError>;
