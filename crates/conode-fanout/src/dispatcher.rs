//! Outbound commit delivery to peer domains.
//!
//! Each peer domain gets one worker task draining a bounded queue. Enqueueing
//! never waits: a full queue is reported as [`FanoutError::Overloaded`] and the
//! caller decides what to do with the commit.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{FanoutError, Result};
use crate::peer::{PeerClient, PeerResponse};

/// A commit waiting to be forwarded to one peer.
#[derive(Debug, Clone)]
pub struct OutboundCommit {
    pub domain: String,
    /// Serialized commit request, forwarded byte for byte.
    pub body: Bytes,
    pub traceparent: Option<String>,
    /// Ephemeral commits get a single attempt.
    pub is_ephemeral: bool,
    /// For logging only.
    pub document_id: String,
}

/// Per-domain queues in front of a [`PeerClient`].
pub struct PeerDispatcher {
    client: Arc<dyn PeerClient>,
    config: DispatchConfig,
    queues: Mutex<HashMap<String, mpsc::Sender<OutboundCommit>>>,
}

impl PeerDispatcher {
    pub fn new(client: Arc<dyn PeerClient>, config: DispatchConfig) -> Self {
        Self {
            client,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn PeerClient> {
        &self.client
    }

    /// Forward a commit now and return the peer's response unchanged.
    pub async fn commit(
        &self,
        domain: &str,
        body: Bytes,
        traceparent: Option<&str>,
    ) -> Result<PeerResponse> {
        self.client.commit(domain, body, traceparent).await
    }

    /// Queue a commit for background delivery.
    ///
    /// Must be called from within a tokio runtime; the domain's worker is
    /// started on first use.
    pub fn enqueue(&self, outbound: OutboundCommit) -> Result<()> {
        let mut queues = self.queues.lock();
        let mut outbound = outbound;

        // A closed queue means its worker is gone; start a new one.
        for _ in 0..2 {
            let tx = queues
                .entry(outbound.domain.clone())
                .or_insert_with(|| self.spawn_worker(&outbound.domain));
            match tx.try_send(outbound) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    warn!(
                        domain = %rejected.domain,
                        document_id = %rejected.document_id,
                        "peer queue full"
                    );
                    return Err(FanoutError::Overloaded(rejected.domain));
                }
                Err(TrySendError::Closed(rejected)) => {
                    queues.remove(&rejected.domain);
                    outbound = rejected;
                }
            }
        }
        Err(FanoutError::unavailable(&outbound.domain, "peer worker unavailable"))
    }

    /// Domains with a running worker.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.queues.lock().keys().cloned().collect();
        domains.sort();
        domains
    }

    fn spawn_worker(&self, domain: &str) -> mpsc::Sender<OutboundCommit> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        debug!(domain = %domain, "starting peer worker");
        tokio::spawn(run_worker(
            Arc::clone(&self.client),
            self.config.clone(),
            rx,
        ));
        tx
    }
}

async fn run_worker(
    client: Arc<dyn PeerClient>,
    config: DispatchConfig,
    mut rx: mpsc::Receiver<OutboundCommit>,
) {
    while let Some(outbound) = rx.recv().await {
        deliver(client.as_ref(), &config, &outbound).await;
    }
}

/// Deliver one commit, retrying with capped exponential backoff.
///
/// Returns whether the peer accepted it.
async fn deliver(
    client: &dyn PeerClient,
    config: &DispatchConfig,
    outbound: &OutboundCommit,
) -> bool {
    let attempts = if outbound.is_ephemeral {
        1
    } else {
        config.max_attempts.max(1)
    };

    for attempt in 1..=attempts {
        let result = client
            .commit(
                &outbound.domain,
                outbound.body.clone(),
                outbound.traceparent.as_deref(),
            )
            .await;

        match result {
            Ok(response) if response.is_success() => {
                info!(
                    domain = %outbound.domain,
                    document_id = %outbound.document_id,
                    status = response.status,
                    "commit forwarded"
                );
                return true;
            }
            Ok(response) if response.is_rejection() => {
                warn!(
                    domain = %outbound.domain,
                    document_id = %outbound.document_id,
                    status = response.status,
                    "peer rejected commit"
                );
                return false;
            }
            Ok(response) => {
                warn!(
                    domain = %outbound.domain,
                    document_id = %outbound.document_id,
                    status = response.status,
                    attempt,
                    "peer delivery failed"
                );
            }
            Err(e) => {
                warn!(
                    domain = %outbound.domain,
                    document_id = %outbound.document_id,
                    error = %e,
                    attempt,
                    "peer delivery failed"
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(config.backoff(attempt)).await;
        }
    }

    warn!(
        domain = %outbound.domain,
        document_id = %outbound.document_id,
        "giving up on peer delivery"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::memory::MemoryPeerNetwork;
    use std::time::Duration;

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            max_attempts: 4,
            ..DispatchConfig::default()
        }
    }

    fn outbound(domain: &str, ephemeral: bool) -> OutboundCommit {
        OutboundCommit {
            domain: domain.to_string(),
            body: Bytes::from_static(b"{\"document\":\"{}\",\"signature\":\"00\"}"),
            traceparent: Some("00-abc-def-01".into()),
            is_ephemeral: ephemeral,
            document_id: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_delivered() {
        let network = MemoryPeerNetwork::new();
        network.fail_next("b.example", 2);
        let dispatcher = PeerDispatcher::new(Arc::new(network.client()), fast_config());

        dispatcher.enqueue(outbound("b.example", false)).unwrap();
        let seen = network
            .wait_for_commits("b.example", 1, Duration::from_secs(2))
            .await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].traceparent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(dispatcher.domains(), vec!["b.example".to_string()]);
    }

    #[tokio::test]
    async fn test_ephemeral_is_not_retried() {
        let network = MemoryPeerNetwork::new();
        network.fail_next("b.example", 1);
        let client = network.client();

        let delivered = deliver(&client, &fast_config(), &outbound("b.example", true)).await;
        assert!(!delivered);
        assert!(network.commits().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_stops_retries() {
        let network = MemoryPeerNetwork::new();
        network.respond_with("b.example", 403);
        let client = network.client();

        let delivered = deliver(&client, &fast_config(), &outbound("b.example", false)).await;
        assert!(!delivered);
        assert_eq!(network.commits_to("b.example").len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let network = MemoryPeerNetwork::new();
        // Keep the worker busy retrying so the queue cannot drain.
        network.fail_next("slow.example", usize::MAX);
        let config = DispatchConfig {
            queue_capacity: 1,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(60),
            ..DispatchConfig::default()
        };
        let dispatcher = PeerDispatcher::new(Arc::new(network.client()), config);

        let mut overloaded = false;
        for _ in 0..4 {
            if let Err(FanoutError::Overloaded(domain)) =
                dispatcher.enqueue(outbound("slow.example", false))
            {
                assert_eq!(domain, "slow.example");
                overloaded = true;
            }
            tokio::task::yield_now().await;
        }
        assert!(overloaded);
    }

    #[tokio::test]
    async fn test_direct_commit_passes_response_through() {
        let network = MemoryPeerNetwork::new();
        network.respond_with("b.example", 409);
        let dispatcher = PeerDispatcher::new(Arc::new(network.client()), fast_config());

        let response = dispatcher
            .commit("b.example", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        assert_eq!(response.status, 409);
    }
}
