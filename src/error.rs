use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures that can surface from the conversation subsystem.
///
/// Every REST handler returns these; the `IntoResponse` impl maps them to
/// status codes so handlers can just use `?`.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    /// Chat creation between principals whose kinds don't form a
    /// student/TPO pair.
    #[error("invalid participant pair: {0}")]
    InvalidPair(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ChatError::InvalidPair(_) | ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Database(_) | ChatError::Serialization(_) | ChatError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code included in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated(_) => "UNAUTHENTICATED",
            ChatError::InvalidPair(_) => "INVALID_PAIR",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::InvalidInput(_) => "INVALID_INPUT",
            ChatError::Database(_) => "DATABASE_ERROR",
            ChatError::Serialization(_) => "SERIALIZATION_ERROR",
            ChatError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    code: &'static str,
    message: String,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetails {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
