//! Error types for policy evaluation.

use thiserror::Error;

/// Errors raised while resolving or evaluating a policy.
///
/// Evaluation never fails the request on its own: these errors are recorded
/// in the decision trace and the statement counts as neither allow nor deny.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// A named policy is not registered.
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// An inline policy failed to parse.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
