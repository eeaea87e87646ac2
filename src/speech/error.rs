//! Error taxonomy of the speech backends.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend unreachable after the configured retries, or lost mid-stream.
    Connection(String),
    /// No handshake within the handshake timeout. Retried internally.
    HandshakeTimeout(Duration),
    /// Embedded session cap reached. Never retried.
    AdmissionLimitExceeded { limit: usize },
    SessionNotFound(String),
    NotInitialized,
    Model(String),
    Codec(String),
}

impl BackendError {
    /// Short machine-readable kind, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Connection(_) => "connection_error",
            BackendError::HandshakeTimeout(_) => "handshake_timeout",
            BackendError::AdmissionLimitExceeded { .. } => "admission_limit_exceeded",
            BackendError::SessionNotFound(_) => "session_not_found",
            BackendError::NotInitialized => "not_initialized",
            BackendError::Model(_) => "model_error",
            BackendError::Codec(_) => "codec_error",
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Connection(msg) => write!(f, "Backend connection failed: {}", msg),
            BackendError::HandshakeTimeout(after) => {
                write!(f, "No handshake from backend within {:.1}s", after.as_secs_f64())
            }
            BackendError::AdmissionLimitExceeded { limit } => {
                write!(f, "Maximum concurrent sessions ({}) reached", limit)
            }
            BackendError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            BackendError::NotInitialized => write!(f, "Speech backend is not initialized"),
            BackendError::Model(msg) => write!(f, "Model error: {}", msg),
            BackendError::Codec(msg) => write!(f, "Codec error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<candle_core::Error> for BackendError {
    fn from(err: candle_core::Error) -> Self {
        BackendError::Model(err.to_string())
    }
}
