//! # Error Handling
//!
//! HTTP-facing error type. Everything a handler can fail with ends up as an
//! [`AppError`], which renders itself as a JSON error body.
//!
//! ## Layers:
//! - **`BackendError`** (speech layer): typed failures from a speech backend,
//!   converted here so handlers can use `?` on backend calls
//! - **`CodecError`** (audio layer): never reaches this module; codec failures
//!   are absorbed per frame
//! - **`anyhow::Error`**: startup and configuration plumbing
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "Maximum concurrent sessions (4) reached",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::speech::BackendError;

/// Errors surfaced by HTTP handlers.
///
/// ## Status Mapping:
/// - **Internal / ConfigError** → 500
/// - **BadRequest / ValidationError** → 400
/// - **NotFound** → 404
/// - **ServiceUnavailable** → 503 (backend unreachable, admission limit, not initialized)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    /// The speech backend cannot take the request right now.
    ServiceUnavailable(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON is the client's fault, so it maps to 400.
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

/// Backend failures a client can retry later are 503; a missing session is 404.
impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::SessionNotFound(id) => AppError::NotFound(format!("Session {} not found", id)),
            BackendError::Connection(_)
            | BackendError::HandshakeTimeout(_)
            | BackendError::AdmissionLimitExceeded { .. }
            | BackendError::NotInitialized => AppError::ServiceUnavailable(err.to_string()),
            BackendError::Model(_) | BackendError::Codec(_) => AppError::Internal(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ConfigError("x".into()).error_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_backend_error_conversion() {
        let admission: AppError = BackendError::AdmissionLimitExceeded { limit: 2 }.into();
        match admission {
            AppError::ServiceUnavailable(msg) => assert_eq!(msg, "Maximum concurrent sessions (2) reached"),
            other => panic!("unexpected {:?}", other),
        }

        let missing: AppError = BackendError::SessionNotFound("abc".into()).into();
        assert!(matches!(missing, AppError::NotFound(_)));

        let model: AppError = BackendError::Model("boom".into()).into();
        assert!(matches!(model, AppError::Internal(_)));
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let app: AppError = err.into();
        assert!(app.to_string().starts_with("Bad request: JSON parsing error"));
    }
}
