//! Error types for the node.
//!
//! Every failure surfaces as one of the ten [`ErrorKind`]s; lower layers are
//! mapped here and nowhere else.

use conode_core::{CoreError, ErrorKind};
use conode_fanout::FanoutError;
use conode_policy::PolicyError;
use conode_store::StoreError;
use thiserror::Error;

fn detail(s: &str) -> String {
    if s.is_empty() {
        String::new()
    } else {
        format!(": {}", s)
    }
}

/// Errors returned by node operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("not found{}", detail(.0))]
    NotFound(String),

    #[error("already exists{}", detail(.0))]
    AlreadyExists(String),

    #[error("already deleted{}", detail(.0))]
    AlreadyDeleted(String),

    #[error("permission denied{}", detail(.0))]
    PermissionDenied(String),

    #[error("invalid signature{}", detail(.0))]
    InvalidSignature(String),

    #[error("malformed{}", detail(.0))]
    Malformed(String),

    #[error("conflict{}", detail(.0))]
    Conflict(String),

    #[error("overloaded{}", detail(.0))]
    Overloaded(String),

    #[error("unavailable{}", detail(.0))]
    Unavailable(String),

    #[error("internal{}", detail(.0))]
    Internal(String),
}

impl NodeError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::AlreadyExists => Self::AlreadyExists(detail),
            ErrorKind::AlreadyDeleted => Self::AlreadyDeleted(detail),
            ErrorKind::PermissionDenied => Self::PermissionDenied(detail),
            ErrorKind::InvalidSignature => Self::InvalidSignature(detail),
            ErrorKind::Malformed => Self::Malformed(detail),
            ErrorKind::Conflict => Self::Conflict(detail),
            ErrorKind::Overloaded => Self::Overloaded(detail),
            ErrorKind::Unavailable => Self::Unavailable(detail),
            ErrorKind::Internal => Self::Internal(detail),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::AlreadyDeleted(_) => ErrorKind::AlreadyDeleted,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidSignature(_) => ErrorKind::InvalidSignature,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Overloaded(_) => ErrorKind::Overloaded,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    pub fn deadline_exceeded() -> Self {
        Self::Unavailable("deadline exceeded".into())
    }
}

impl From<CoreError> for NodeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidSignature => Self::InvalidSignature(String::new()),
            // The display form already says "malformed document".
            CoreError::Malformed(msg) => Self::Malformed(msg),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DeadlineExceeded => Self::deadline_exceeded(),
            e if e.is_transient() => Self::Unavailable(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<PolicyError> for NodeError {
    fn from(err: PolicyError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<FanoutError> for NodeError {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::Overloaded(domain) => {
                Self::Overloaded(format!("peer queue for {}", domain))
            }
            e => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {}", err))
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_stable() {
        assert_eq!(NodeError::InvalidSignature(String::new()).to_string(), "invalid signature");
        assert_eq!(
            NodeError::Malformed("timelines[0]: invalid type".into()).to_string(),
            "malformed: timelines[0]: invalid type"
        );
    }

    #[test]
    fn test_kind_round_trip() {
        use ErrorKind::*;
        for kind in [
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
        ] {
            assert_eq!(NodeError::new(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_lower_layers_map_to_kinds() {
        assert_eq!(NodeError::from(StoreError::DeadlineExceeded), NodeError::deadline_exceeded());
        assert_eq!(
            NodeError::from(FanoutError::Overloaded("b.example".into())).kind(),
            ErrorKind::Overloaded
        );
        assert_eq!(
            NodeError::from(CoreError::UnknownType("bogus".into())).kind(),
            ErrorKind::Malformed
        );
    }
}
