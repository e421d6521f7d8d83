//! Tunables for the hub and the dispatcher.

use std::time::Duration;

/// Realtime hub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// A response send taking longer than this ends the connection.
    pub write_timeout: Duration,
    /// Events buffered per connection before it is dropped.
    pub queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            queue_size: 64,
        }
    }
}

/// Peer dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Outbound commits buffered per peer domain.
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Delivery attempts per queued commit, including the first.
    pub max_attempts: u32,
    /// URL scheme for peer requests. `https` outside of tests.
    pub scheme: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            request_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 8,
            scheme: "https".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = DispatchConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(4), Duration::from_secs(4));
        assert_eq!(config.backoff(7), Duration::from_secs(30));
        assert_eq!(config.backoff(64), Duration::from_secs(30));
    }
}
