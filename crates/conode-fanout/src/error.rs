//! Error types for event fan-out.

use thiserror::Error;

/// Errors that can occur while delivering events.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The outbound queue for a peer is full.
    #[error("peer queue for {0} is full")]
    Overloaded(String),

    /// The peer could not be reached.
    #[error("peer {domain} unavailable: {reason}")]
    Unavailable { domain: String, reason: String },

    /// The peer answered with something we could not read.
    #[error("invalid response from {domain}: {reason}")]
    InvalidResponse { domain: String, reason: String },

    /// The HTTP client could not be built.
    #[error("http client: {0}")]
    Client(String),

    /// No peer client is configured for remote traffic.
    #[error("no peer client configured")]
    NoPeerClient,
}

impl FanoutError {
    pub(crate) fn unavailable(domain: &str, reason: impl ToString) -> Self {
        Self::Unavailable {
            domain: domain.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(domain: &str, reason: impl ToString) -> Self {
        Self::InvalidResponse {
            domain: domain.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
