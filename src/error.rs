//! Error types for the change feed client.

use http::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Error for invalid HTTP header configuration.
#[derive(Debug, Clone, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Main error type for requests against a database.
#[derive(Debug, Error)]
pub enum CouchError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("document update conflict")]
    Conflict,

    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error: {status} - {error}: {reason}")]
    Server {
        status: u16,
        error: String,
        reason: String,
    },

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("timeout")]
    Timeout,

    #[error("json error: {0}")]
    Json(String),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// The JSON error body returned by the server on failure.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

impl CouchError {
    /// Create error from HTTP status code
    pub fn from_status(status: u16, url: &str) -> Self {
        Self::from_status_and_body(status, url, ErrorBody::default())
    }

    /// Create error from a status code and the raw response body.
    ///
    /// The body is expected to hold `{"error": ..., "reason": ...}`; anything
    /// else is kept verbatim as the reason.
    pub(crate) fn from_response(status: u16, url: &str, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).unwrap_or_else(|_| ErrorBody {
            error: String::new(),
            reason: body.trim().to_string(),
        });
        Self::from_status_and_body(status, url, parsed)
    }

    fn from_status_and_body(status: u16, url: &str, body: ErrorBody) -> Self {
        let reason = if body.reason.is_empty() {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("unknown")
                .to_string()
        } else {
            body.reason
        };

        match status {
            400 => CouchError::BadRequest { reason },
            401 => CouchError::Unauthorized,
            403 => CouchError::Forbidden,
            404 => CouchError::NotFound {
                url: url.to_string(),
            },
            409 => CouchError::Conflict,
            412 => CouchError::PreconditionFailed { reason },
            429 => CouchError::RateLimited { retry_after: None },
            _ => CouchError::Server {
                status,
                error: if body.error.is_empty() {
                    format!("status {status}")
                } else {
                    body.error
                },
                reason,
            },
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            CouchError::RateLimited { .. } => true,
            CouchError::Server { status, .. } => *status >= 500,
            CouchError::Network(_) => true,
            CouchError::Timeout => true,
            _ => false,
        }
    }

    /// How long the server asked us to wait before retrying, if it said.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CouchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn with_retry_after(self, delay: Option<Duration>) -> Self {
        match self {
            CouchError::RateLimited { .. } => CouchError::RateLimited { retry_after: delay },
            other => other,
        }
    }

    /// HTTP status code if applicable
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CouchError::BadRequest { .. } => Some(400),
            CouchError::Unauthorized => Some(401),
            CouchError::Forbidden => Some(403),
            CouchError::NotFound { .. } => Some(404),
            CouchError::Conflict => Some(409),
            CouchError::PreconditionFailed { .. } => Some(412),
            CouchError::RateLimited { .. } => Some(429),
            CouchError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CouchError::Timeout
        } else {
            CouchError::Network(err)
        }
    }
}

impl From<serde_json::Error> for CouchError {
    fn from(err: serde_json::Error) -> Self {
        CouchError::Json(err.to_string())
    }
}

/// A change line that could not be decoded into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undecodable change record: {message}")]
pub struct DecodeError {
    /// The offending line, trimmed.
    pub line: String,
    /// What the JSON decoder reported.
    pub message: String,
}

/// Errors raised by, or recorded inside, a continuous feed session.
///
/// Only [`FeedError::NoRuntime`] is ever returned to a caller; the other
/// variants are recorded by the read loop and exposed through
/// `last_error()`.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("no tokio runtime is available to drive the feed")]
    NoRuntime,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("change line longer than {limit} bytes discarded")]
    LineTooLong { limit: usize },

    #[error("change handler panicked at seq {seq}: {message}")]
    HandlerPanicked { seq: u64, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}
