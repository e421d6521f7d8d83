//! Node configuration.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use conode_fanout::{DispatchConfig, HubConfig};
use conode_policy::Policy;

/// Configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The domain this node serves.
    pub domain: String,
    /// Whether local registration is open to anyone.
    pub registration_open: bool,
    /// Name of a registered policy consulted for local registration.
    pub registration_policy: Option<String>,
    /// CCID of the domain's own entity, the only signer of domain-owned
    /// records.
    pub domain_ccid: Option<String>,
    /// Tolerated clock skew for a `signedAt` in the future.
    pub signed_at_skew: Duration,
    /// How long after its window ends a chunk is still considered open.
    pub chunk_grace: Duration,
    /// Windows walked when paging a remote timeline.
    pub max_chunk_lookback: usize,
    /// Most closed chunks kept in memory.
    pub chunk_cache_capacity: usize,
    /// How long a cached chunk is served before it is fetched again.
    pub chunk_cache_ttl: StdDuration,
    /// Attempts for a commit transaction that hits a busy database.
    pub commit_retry_attempts: u32,
    pub hub: HubConfig,
    pub dispatch: DispatchConfig,
    /// Named policies resolvable by a record's `policy` field.
    pub policies: HashMap<String, Policy>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            registration_open: true,
            registration_policy: None,
            domain_ccid: None,
            signed_at_skew: Duration::seconds(30),
            chunk_grace: Duration::seconds(60),
            max_chunk_lookback: 6,
            chunk_cache_capacity: 4096,
            chunk_cache_ttl: StdDuration::from_secs(3600),
            commit_retry_attempts: 3,
            hub: HubConfig::default(),
            dispatch: DispatchConfig::default(),
            policies: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("CONODE_DOMAIN") {
            if !val.is_empty() {
                config.domain = val;
            }
        }

        if let Some(val) = lookup("CONODE_DOMAIN_CCID") {
            if !val.is_empty() {
                config.domain_ccid = Some(val);
            }
        }

        if let Some(val) = lookup("CONODE_REGISTRATION_OPEN") {
            if let Ok(open) = val.parse::<bool>() {
                config.registration_open = open;
            }
        }

        if let Some(val) = lookup("CONODE_SIGNED_AT_SKEW_SECS") {
            if let Ok(secs) = val.parse::<i64>() {
                config.signed_at_skew = Duration::seconds(secs);
            }
        }

        if let Some(val) = lookup("CONODE_CHUNK_GRACE_SECS") {
            if let Ok(secs) = val.parse::<i64>() {
                config.chunk_grace = Duration::seconds(secs);
            }
        }

        if let Some(val) = lookup("CONODE_CHUNK_CACHE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                config.chunk_cache_capacity = capacity;
            }
        }

        if let Some(val) = lookup("CONODE_CHUNK_CACHE_TTL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.chunk_cache_ttl = StdDuration::from_secs(secs);
            }
        }

        if let Some(val) = lookup("CONODE_WS_WRITE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.hub.write_timeout = StdDuration::from_millis(ms);
            }
        }

        if let Some(val) = lookup("CONODE_PEER_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                config.dispatch.queue_capacity = capacity;
            }
        }

        config
    }
}
