//! Error taxonomy and the result carrier surfaced to callers.
//!
//! Every failure that crosses a Catga boundary is a [`CatgaError`]: a closed
//! [`ErrorKind`], a short machine code and a human-readable message.
//! Infrastructure errors are mapped at the boundary where they occur:
//!
//! - missing handler -> `NotFound`
//! - invalid request (empty payload, failed validation) -> `Validation`
//! - optimistic-concurrency mismatch -> `Conflict`
//! - transient backend/transport failure -> `Unavailable` (retryable)
//! - caller cancelled -> `Cancelled`; internal deadline fired -> `Timeout`
//! - everything else -> `Internal`

use serde::{Deserialize, Serialize};

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unavailable,
    Timeout,
    Internal,
    Cancelled,
    Unauthorized,
}

impl ErrorKind {
    /// Retry helps only for transient classes.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unauthorized => "unauthorized",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure carrier: kind + short machine code + human string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CatgaError {
    kind: ErrorKind,
    code: String,
    message: String,
}

pub type CatgaResult<T> = Result<T, CatgaError>;

impl CatgaError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, code, message)
    }

    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, code, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled", "operation was cancelled")
    }

    /// Map an unclassified error to `Internal`, preserving its message.
    pub fn internal_from(code: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, code, err.to_string())
    }

    /// Map a transient backend error to `Unavailable`, preserving its message.
    pub fn unavailable_from(code: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Unavailable, code, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = CatgaError::not_found("handler_missing", "no handler for Ping");
        assert_eq!(err.to_string(), "handler_missing: no handler for Ping");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn errors_round_trip_through_serde() {
        let err = CatgaError::conflict("version_conflict", "expected 3, found 5");
        let json = serde_json::to_string(&err).unwrap();
        let back: CatgaError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
