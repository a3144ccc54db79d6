//! Crate-wide error types and their mapping onto the HTTP surface.
//!
//! Mirrors the teacher's `utils/error.rs`: one `thiserror`-derived enum,
//! one `IntoResponse` impl, structured `tracing` logging per variant. The
//! `kind()` tag additionally distinguishes Validation / Transient / Fatal
//! per the design note in SPEC_FULL.md §9, so retry logic elsewhere in the
//! crate can match on it without re-deriving intent from the HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("retrieval failed: {0}")]
    RetrievalTimeout(String),

    #[error("bad retrieval parameters: {0}")]
    BadRetrievalParams(String),

    #[error("llm adapter failure: {0}")]
    LlmFailure(String),

    #[error("span lookup failed: {0}")]
    SpanLookupMiss(String),

    #[error("async queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("job not found")]
    JobNotFound,

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_)
            | ApiError::BadRetrievalParams(_)
            | ApiError::PayloadTooLarge
            | ApiError::RateLimited
            | ApiError::JobNotFound => ErrorKind::Validation,
            ApiError::RetrievalTimeout(_) | ApiError::QueueUnavailable(_) => ErrorKind::Transient,
            ApiError::LlmFailure(_)
            | ApiError::SpanLookupMiss(_)
            | ApiError::Config(_)
            | ApiError::Internal(_) => ErrorKind::Fatal,
        }
    }

    fn status_and_label(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation"),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RateLimited"),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge"),
            ApiError::RetrievalTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "RetrievalTimeout"),
            ApiError::BadRetrievalParams(_) => (StatusCode::BAD_REQUEST, "BadRetrievalParams"),
            ApiError::LlmFailure(_) => (StatusCode::BAD_GATEWAY, "LlmFailure"),
            ApiError::SpanLookupMiss(_) => (StatusCode::NOT_FOUND, "SpanLookupMiss"),
            ApiError::QueueUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "QueueUnavailable"),
            ApiError::JobNotFound => (StatusCode::NOT_FOUND, "JobNotFound"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Config"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
        }
    }

    /// The fixed, sanitized string that is safe to hand to a client. Internal
    /// details (exception messages, backtraces) never cross this boundary.
    pub fn client_message(&self) -> String {
        match self {
            ApiError::Validation(m) | ApiError::BadRetrievalParams(m) => m.clone(),
            ApiError::RateLimited => "rate limit exceeded".to_string(),
            ApiError::PayloadTooLarge => "request body too large".to_string(),
            ApiError::RetrievalTimeout(_) => "retrieval is temporarily unavailable".to_string(),
            ApiError::LlmFailure(_) => "an error occurred while processing your request".to_string(),
            ApiError::SpanLookupMiss(_) => "no matching response to attach feedback to".to_string(),
            ApiError::QueueUnavailable(_) => "the job queue is temporarily unavailable".to_string(),
            ApiError::JobNotFound => "job not found".to_string(),
            ApiError::Config(_) | ApiError::Internal(_) => {
                "an unexpected error occurred".to_string()
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = self.status_and_label();
        match self.kind() {
            ErrorKind::Fatal => tracing::error!(error = %self, "request failed"),
            ErrorKind::Transient => tracing::warn!(error = %self, "transient failure"),
            ErrorKind::Validation => tracing::debug!(error = %self, "rejected request"),
        }
        let body = ErrorResponse {
            error: label,
            message: self.client_message(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
