//! Channel- and connection-scoped protocol errors.
//!
//! A [`ProtocolError`] is what the broker turns into a `channel.close`
//! (soft) or a `connection.close` (hard).

use super::constants::*;
use std::fmt;

/// Scope of a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Closes one channel; the connection survives.
    Soft,
    /// Closes the whole connection.
    Hard,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Soft => write!(f, "soft"),
            ErrorKind::Hard => write!(f, "hard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error {code} ({class_id}.{method_id}): {text}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub code: u16,
    pub class_id: u16,
    pub method_id: u16,
    pub text: String,
}

impl ProtocolError {
    pub fn soft<S: Into<String>>(code: u16, text: S) -> Self {
        Self {
            kind: ErrorKind::Soft,
            code,
            class_id: 0,
            method_id: 0,
            text: text.into(),
        }
    }

    pub fn hard<S: Into<String>>(code: u16, text: S) -> Self {
        Self {
            kind: ErrorKind::Hard,
            code,
            class_id: 0,
            method_id: 0,
            text: text.into(),
        }
    }

    /// Attach the offending method's identifiers.
    pub fn on(mut self, class_id: u16, method_id: u16) -> Self {
        self.class_id = class_id;
        self.method_id = method_id;
        self
    }

    pub fn is_hard(&self) -> bool {
        self.kind == ErrorKind::Hard
    }

    pub fn not_found<S: Into<String>>(text: S) -> Self {
        Self::soft(NOT_FOUND, text)
    }

    pub fn precondition_failed<S: Into<String>>(text: S) -> Self {
        Self::soft(PRECONDITION_FAILED, text)
    }

    pub fn resource_locked<S: Into<String>>(text: S) -> Self {
        Self::soft(RESOURCE_LOCKED, text)
    }

    pub fn access_refused<S: Into<String>>(text: S) -> Self {
        Self::soft(ACCESS_REFUSED, text)
    }

    pub fn unexpected_frame<S: Into<String>>(text: S) -> Self {
        Self::hard(UNEXPECTED_FRAME, text)
    }

    pub fn command_invalid<S: Into<String>>(text: S) -> Self {
        Self::hard(COMMAND_INVALID, text)
    }

    pub fn not_implemented<S: Into<String>>(text: S) -> Self {
        Self::hard(NOT_IMPLEMENTED, text)
    }

    pub fn not_allowed<S: Into<String>>(text: S) -> Self {
        Self::hard(NOT_ALLOWED, text)
    }

    pub fn channel_error<S: Into<String>>(text: S) -> Self {
        Self::hard(CHANNEL_ERROR, text)
    }

    pub fn internal<S: Into<String>>(text: S) -> Self {
        Self::hard(INTERNAL_ERROR, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_error_carries_method() {
        let err = ProtocolError::not_found("no queue 'q1'").on(CLASS_QUEUE, QUEUE_BIND);
        assert_eq!(err.kind, ErrorKind::Soft);
        assert_eq!(err.code, NOT_FOUND);
        assert_eq!((err.class_id, err.method_id), (40, 20));
        assert!(!err.is_hard());
        assert_eq!(err.to_string(), "soft error 404 (40.20): no queue 'q1'");
    }

    #[test]
    fn test_hard_error() {
        let err = ProtocolError::not_implemented("headers exchange");
        assert!(err.is_hard());
        assert_eq!(err.code, 540);
    }
}
