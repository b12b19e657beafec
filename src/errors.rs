//! Application error model with HTTP status mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to an HTTP status code at the axum boundary.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the ingestion service may encounter. Inner
/// components raise these; the pipeline catches at the per-message boundary
/// and HTTP handlers translate to status codes.
#[derive(Debug, Error)]
pub enum AppError {
    /// Network, TLS, or IMAP/SMTP protocol failure (retried on the next tick)
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication failure against the mail server or relay
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Message could not be parsed at all
    #[error("parse error: {0}")]
    Parse(String),
    /// Filesystem failure in the attachment store
    #[error("storage error: {0}")]
    Storage(String),
    /// Database failure (connection, query, or row decode)
    #[error("database error: {0}")]
    Database(String),
    /// Invalid caller input (bad field name, empty recipients, bad date)
    #[error("validation error: {0}")]
    Validation(String),
    /// Resource not found (message, forward record, mailbox)
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid or incomplete configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Convenience constructor for `Validation`
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// HTTP status code for this error
    ///
    /// # Mappings
    ///
    /// - `Validation` → 400
    /// - `NotFound` → 404
    /// - everything else → 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transport(_)
            | Self::Auth(_)
            | Self::Parse(_)
            | Self::Storage(_)
            | Self::Database(_)
            | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_owned()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use axum::http::StatusCode;

    #[test]
    fn maps_validation_to_bad_request() {
        let err = AppError::validation("to_addresses must not be empty");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn maps_not_found_to_404() {
        let err = AppError::NotFound("email 7".to_owned());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn maps_operational_errors_to_500() {
        for err in [
            AppError::Transport("tcp reset".to_owned()),
            AppError::Database("pool timeout".to_owned()),
            AppError::Storage("disk full".to_owned()),
        ] {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}
