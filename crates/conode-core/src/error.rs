//! Error types for conode core.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error taxonomy every layer maps into.
///
/// Each kind has a stable string form and an HTTP status used by the
/// transport shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyDeleted,
    PermissionDenied,
    InvalidSignature,
    Malformed,
    Conflict,
    Overloaded,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Stable string form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::AlreadyDeleted => "already deleted",
            Self::PermissionDenied => "permission denied",
            Self::InvalidSignature => "invalid signature",
            Self::Malformed => "malformed",
            Self::Conflict => "conflict",
            Self::Overloaded => "overloaded",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }

    /// HTTP status code for this kind.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyExists | Self::Conflict => 409,
            Self::AlreadyDeleted => 410,
            Self::PermissionDenied => 403,
            Self::InvalidSignature | Self::Malformed => 400,
            Self::Overloaded => 503,
            Self::Unavailable => 502,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the pure primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("malformed document: type: unknown document type `{0}`")]
    UnknownType(String),

    #[error("malformed document: signedAt: {0} is too far in the future")]
    FutureSignedAt(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSignature => ErrorKind::InvalidSignature,
            Self::InvalidKey(_)
            | Self::InvalidAddress(_)
            | Self::InvalidId(_)
            | Self::Malformed(_)
            | Self::UnknownType(_)
            | Self::FutureSignedAt(_) => ErrorKind::Malformed,
        }
    }
}
