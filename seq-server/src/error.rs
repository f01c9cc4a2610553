//! Error types for chatseq-server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::path::PathBuf;

/// Main error type for server startup and background tasks.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Broker error.
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A message id is already committed to a different chat.
    #[error("message id {message_id} already belongs to another chat")]
    IdConflict {
        /// The conflicting id.
        message_id: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// What failed to decode.
        reason: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Errors returned by HTTP handlers.
///
/// Each variant maps to one status code; the body is `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Caller identity missing or malformed.
    #[error("missing or invalid caller identity")]
    Unauthenticated,

    /// Caller is not a participant of the chat.
    #[error("access denied")]
    AccessDenied,

    /// Resource does not exist.
    #[error("not found")]
    NotFound,

    /// Append quota exceeded.
    #[error("rate limited: {0}")]
    RateLimited(#[from] crate::limits::RateLimitError),

    /// Request conflicts with stored state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Anything else; details are logged, not returned.
    #[error("internal error")]
    Internal,
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::IdConflict { .. } => Self::Conflict(err.to_string()),
            other => {
                tracing::error!(error = %other, "storage failure");
                Self::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::AccessDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::RateLimited(crate::limits::RateLimitError::UserLimitExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn id_conflict_maps_to_conflict() {
        let err: ApiError = StorageError::IdConflict {
            message_id: "abc".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn database_error_is_opaque() {
        let err: ApiError = StorageError::Database(sqlx::Error::RowNotFound).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "internal error");
    }
}
