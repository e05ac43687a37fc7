//! The error taxonomy shared by every PulseFM service.
//!
//! Each variant maps to exactly one HTTP status so that handlers can bubble
//! `PulseError` with `?` and let `IntoResponse` do the translation, instead
//! of hand-rolling a status code at every call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub type PulseResult<T> = Result<T, PulseError>;

#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Malformed or out-of-range caller input. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// The request is well-formed but a precondition the operation depends
    /// on doesn't hold (e.g. closing a poll that's already closed).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A referenced entity doesn't exist in the datastore.
    #[error("not found: {0}")]
    NotFound(String),

    /// DS, KV, or TQ didn't answer, or answered with an error the caller
    /// should retry against.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// A stored document failed to deserialize into its expected shape.
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl PulseError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PulseError::Validation(_) => StatusCode::BAD_REQUEST,
            PulseError::Precondition(_) => StatusCode::CONFLICT,
            PulseError::NotFound(_) => StatusCode::NOT_FOUND,
            PulseError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PulseError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PulseError::Validation(_) => "validation",
            PulseError::Precondition(_) => "precondition",
            PulseError::NotFound(_) => "not_found",
            PulseError::DependencyUnavailable(_) => "dependency_unavailable",
            PulseError::Corrupt(_) => "corrupt",
        }
    }
}

impl IntoResponse for PulseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for PulseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => PulseError::NotFound(e.to_string()),
            other => PulseError::DependencyUnavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for PulseError {
    fn from(e: redis::RedisError) -> Self {
        PulseError::DependencyUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(e: serde_json::Error) -> Self {
        PulseError::Corrupt(e.to_string())
    }
}

impl From<reqwest::Error> for PulseError {
    fn from(e: reqwest::Error) -> Self {
        PulseError::DependencyUnavailable(e.to_string())
    }
}
