//! Error taxonomy shared by every Parallax RPC surface.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, carried on the wire so that callers
/// can react without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The named entity does not exist.
    NotFound,
    /// The request conflicts with existing state (duplicate endpoint,
    /// replacing an already-active deployment, ...).
    Conflict,
    /// The request itself is malformed.
    InvalidArgument,
    /// The entity exists but is in the wrong state for the operation.
    FailedPrecondition,
    /// A collaborator could not be reached.
    Unavailable,
    /// The operation ran out of time.
    DeadlineExceeded,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    /// The HTTP status this kind maps to at an API boundary.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::InvalidArgument => 400,
            Self::FailedPrecondition => 412,
            Self::Unavailable => 503,
            Self::DeadlineExceeded => 408,
            Self::Internal => 500,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidArgument => "invalid_argument",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error as serialised across an RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::FailedPrecondition.http_status(), 412);
        assert_eq!(ErrorKind::DeadlineExceeded.http_status(), 408);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn wire_round_trip() {
        let err = WireError::new(ErrorKind::Unavailable, "runner unreachable");
        let json = serde_json::to_string(&err).unwrap();
        let back: WireError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.to_string(), "unavailable: runner unreachable");
    }
}
