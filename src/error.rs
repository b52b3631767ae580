//! Error types for mail-ingest.

use crate::metrics::Outcome;
use crate::normalize::{FieldError, ParseError};
use crate::store::StorageError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::fmt;
use std::io;
use std::time::Duration;

/// Errors raised while starting or running the server.
#[derive(Debug)]
pub enum Error {
    /// I/O errors (binding the listener)
    Io(io::Error),
    /// Storage backend setup errors
    Storage(StorageError),
    /// Metric registration errors
    Metrics(prometheus::Error),
    /// Configuration errors
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Metrics(e) => write!(f, "metrics error: {e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Metrics(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e)
    }
}

/// Result type alias for mail-ingest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client-facing request failures.
///
/// Server-side variants carry no detail: the cause is logged with the
/// request id where it happens and the caller only sees the classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Missing or mismatched bearer token
    Unauthorized(&'static str),
    /// Body could not be read or parsed
    BadRequest(String),
    /// Submission route called with the wrong method
    MethodNotAllowed,
    /// Parsed fine but the record is unacceptable
    Validation(Vec<FieldError>),
    /// Rate limiter denied the request
    RateLimited { retry_after: Duration },
    /// Server is draining
    Unavailable,
    /// Request exceeded the processing deadline
    Timeout,
    /// Persistence failed
    Storage,
    /// Unexpected fault, including panics
    Internal,
    NotFound,
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable | Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Stable machine-readable classification.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Validation(_) => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Storage => "storage_error",
            Self::Internal => "internal_error",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(msg) => write!(f, "{msg}"),
            Self::BadRequest(msg) => write!(f, "{msg}"),
            Self::MethodNotAllowed => write!(f, "method not allowed"),
            Self::Validation(problems) => {
                write!(f, "submission failed validation ({} problems)", problems.len())
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limit exceeded, retry in {}s", retry_after.as_secs())
            }
            Self::Unavailable => write!(f, "server is shutting down"),
            Self::Timeout => write!(f, "request took too long to process"),
            Self::Storage => write!(f, "failed to store email"),
            Self::Internal => write!(f, "internal server error"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ParseError> for ApiError {
    fn from(e: ParseError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let Self::Validation(problems) = &self {
            body["details"] = json!(problems);
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let Self::RateLimited { retry_after } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response.extensions_mut().insert(Outcome(self.kind()));
        response
    }
}
