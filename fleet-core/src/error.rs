use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy shared by every subsystem. Leaves return typed errors,
/// orchestrators translate into one of these kinds, the HTTP layer maps the
/// kind to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthRequired,
    AuthFailed,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    ValidationError,
    ServiceBusy,
    UpstreamUnavailable,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AuthRequired => "AUTH_REQUIRED",
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ServiceBusy => "SERVICE_BUSY",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    /// Wraps an unexpected error, logging the original under a correlation id
    /// so the user-visible message stays opaque.
    pub fn internal(err: impl fmt::Display) -> Self {
        let correlation = Uuid::new_v4();
        tracing::error!(%correlation, "internal error: {err}");
        Self::new(ErrorKind::Internal, format!("internal error ({correlation})"))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(other) => CoreError::internal(other),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                CoreError::new(ErrorKind::UpstreamUnavailable, "database unavailable")
            }
            other => CoreError::internal(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
