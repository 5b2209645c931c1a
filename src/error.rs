//! Unified application error model and mapping helpers.
//! This module provides a common error enum used across the protocol gateway,
//! the repository lifecycle manager and the review engine, along with the
//! HTTP mapping used by all request handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::{Display, Formatter};

/// Request-scoped error carried by every fallible operation in the crate.
///
/// Each variant pairs a stable machine-readable code with a human-readable
/// message. Structural corruption (`Corrupt`) is deliberately request-scoped:
/// one corrupted repository or review must not take down service to the rest.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Malformed input from the client: bad repository name, path too deep,
    /// duplicate on create, group non-empty on delete.
    UserInput { code: String, message: String },
    /// Missing repository, review or review branch, or a missing static file.
    NotFound { code: String, message: String },
    /// Bad HTTP Basic credential; mapped to 401 with a challenge header.
    Auth { code: String, message: String },
    /// Bad admin password or an unroutable path.
    Forbidden { code: String, message: String },
    /// Path matched a service pattern but with the wrong HTTP method.
    MethodNotAllowed { code: String, message: String },
    /// Non-zero exit from the git subprocess.
    Subprocess { code: String, message: String },
    /// On-disk state violates a structural invariant (directory shape,
    /// review directory naming grammar).
    Corrupt { code: String, message: String },
    /// Filesystem error other than not-found.
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::MethodNotAllowed { code, .. }
            | AppError::Subprocess { code, .. }
            | AppError::Corrupt { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::MethodNotAllowed { message, .. }
            | AppError::Subprocess { message, .. }
            | AppError::Corrupt { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn method_not_allowed<S: Into<String>>(code: S, msg: S) -> Self { AppError::MethodNotAllowed { code: code.into(), message: msg.into() } }
    pub fn subprocess<S: Into<String>>(code: S, msg: S) -> Self { AppError::Subprocess { code: code.into(), message: msg.into() } }
    pub fn corrupt<S: Into<String>>(code: S, msg: S) -> Self { AppError::Corrupt { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Auth { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::MethodNotAllowed { .. } => 405,
            AppError::Subprocess { .. } => 500,
            AppError::Corrupt { .. } => 500,
            AppError::Io { .. } => 500,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::not_found("not_found".to_string(), err.to_string())
        } else {
            AppError::io("io_error".to_string(), err.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        // The Basic challenge header for 401 is attached at the call site,
        // where the realm is known from configuration.
        (status, self.message().to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_name", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::auth("bad_credential", "no").http_status(), 401);
        assert_eq!(AppError::forbidden("bad_password", "no").http_status(), 403);
        assert_eq!(AppError::method_not_allowed("method", "no").http_status(), 405);
        assert_eq!(AppError::subprocess("git_failed", "exit 128").http_status(), 500);
        assert_eq!(AppError::corrupt("bad_review_dir", "x.bogus").http_status(), 500);
        assert_eq!(AppError::io("io_error", "denied").http_status(), 500);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(AppError::from(err), AppError::NotFound { .. }));
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(AppError::from(err), AppError::Io { .. }));
    }
}
