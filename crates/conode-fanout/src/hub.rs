//! Realtime event hub.
//!
//! Connections register a set of timeline ids and receive every event
//! published on them. The hub never owns a socket: a connection is a pair of
//! channels, fed and drained by the transport.
//!
//! Remote timelines are served by one upstream stream per timeline, shared by
//! every local subscriber and closed when the last of them leaves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use conode_core::Event;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::peer::PeerClient;

/// Identifies one realtime connection.
pub type ConnId = u64;

/// Split `id@domain`. Bare ids belong to no domain.
pub fn timeline_domain(timeline: &str) -> Option<&str> {
    timeline.rsplit_once('@').map(|(_, domain)| domain)
}

struct Subscriber {
    timelines: HashSet<String>,
    tx: mpsc::Sender<Event>,
}

struct Upstream {
    refs: usize,
    task: JoinHandle<()>,
}

struct HubInner {
    config: HubConfig,
    local_domain: String,
    peer: Option<Arc<dyn PeerClient>>,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<ConnId, Subscriber>>,
    upstreams: Mutex<HashMap<String, Upstream>>,
}

/// Fan-out of events to realtime connections.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new(
        config: HubConfig,
        local_domain: impl Into<String>,
        peer: Option<Arc<dyn PeerClient>>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                local_domain: local_domain.into(),
                peer,
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
                upstreams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// `id@local_domain` for bare ids; qualified ids are kept as given.
    pub fn qualify(&self, timeline: &str) -> String {
        if timeline_domain(timeline).is_some() {
            timeline.to_string()
        } else {
            format!("{}@{}", timeline, self.inner.local_domain)
        }
    }

    /// Serve one connection until either side goes away.
    ///
    /// Every message on `requests` replaces the connection's timeline set.
    /// Matching events go to `responses` in the order the hub saw them. The
    /// connection ends when `requests` closes, when `responses` closes or
    /// stays blocked past the write timeout, or when the connection falls so
    /// far behind that its queue overflows.
    pub async fn realtime(
        &self,
        mut requests: mpsc::Receiver<Vec<String>>,
        responses: mpsc::Sender<Event>,
    ) {
        let (tx, mut rx) = mpsc::channel(self.inner.config.queue_size.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                timelines: HashSet::new(),
                tx,
            },
        );
        debug!(conn = id, "realtime connection opened");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(timelines) => self.resubscribe(id, timelines),
                    None => break,
                },
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!(conn = id, "realtime connection dropped by hub");
                        break;
                    };
                    let sent = tokio::time::timeout(
                        self.inner.config.write_timeout,
                        responses.send(event),
                    )
                    .await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            warn!(conn = id, "realtime write timed out");
                            break;
                        }
                    }
                }
            }
        }

        self.remove(id);
        debug!(conn = id, "realtime connection closed");
    }

    /// Deliver `event` to every connection subscribed to its timeline.
    ///
    /// Returns the number of connections it was queued for.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, sub) in subscribers.iter() {
                if !sub.timelines.contains(&event.timeline) {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        overflowed.push(*id)
                    }
                }
            }
        }
        for id in overflowed {
            warn!(conn = id, timeline = %event.timeline, "dropping slow realtime connection");
            self.remove(id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Remote timelines with a live upstream stream.
    pub fn upstream_count(&self) -> usize {
        self.inner.upstreams.lock().len()
    }

    /// Upstream refs change under the subscribers lock, so they always match
    /// the timeline sets it holds.
    fn resubscribe(&self, id: ConnId, timelines: Vec<String>) {
        let next: HashSet<String> = timelines.iter().map(|t| self.qualify(t)).collect();
        let mut subscribers = self.inner.subscribers.write();
        let Some(sub) = subscribers.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut sub.timelines, next.clone());

        for timeline in next.difference(&previous) {
            self.acquire_upstream(timeline);
        }
        for timeline in previous.difference(&next) {
            self.release_upstream(timeline);
        }
        drop(subscribers);
        debug!(conn = id, timelines = next.len(), "realtime subscription replaced");
    }

    fn remove(&self, id: ConnId) {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(sub) = subscribers.remove(&id) {
            for timeline in &sub.timelines {
                self.release_upstream(timeline);
            }
        }
    }

    fn is_remote(&self, timeline: &str) -> Option<String> {
        match timeline_domain(timeline) {
            Some(domain) if domain != self.inner.local_domain => Some(domain.to_string()),
            _ => None,
        }
    }

    fn acquire_upstream(&self, timeline: &str) {
        let Some(domain) = self.is_remote(timeline) else {
            return;
        };
        let Some(peer) = self.inner.peer.clone() else {
            return;
        };

        let mut upstreams = self.inner.upstreams.lock();
        let spawn = || {
            let hub = Arc::downgrade(&self.inner);
            tokio::spawn(run_upstream(hub, peer, domain, timeline.to_string()))
        };
        match upstreams.get_mut(timeline) {
            Some(upstream) => {
                upstream.refs += 1;
                // A stream that failed to open or ended is retried by the
                // next subscriber.
                if upstream.task.is_finished() {
                    debug!(timeline = %timeline, "reopening upstream");
                    upstream.task = spawn();
                }
            }
            None => {
                upstreams.insert(timeline.to_string(), Upstream { refs: 1, task: spawn() });
            }
        }
    }

    fn release_upstream(&self, timeline: &str) {
        let mut upstreams = self.inner.upstreams.lock();
        let Some(upstream) = upstreams.get_mut(timeline) else {
            return;
        };
        upstream.refs -= 1;
        if upstream.refs == 0 {
            if let Some(upstream) = upstreams.remove(timeline) {
                upstream.task.abort();
                debug!(timeline = %timeline, "upstream closed");
            }
        }
    }
}

async fn run_upstream(
    hub: Weak<HubInner>,
    peer: Arc<dyn PeerClient>,
    domain: String,
    timeline: String,
) {
    let mut events = match peer.open_stream(&domain, vec![timeline.clone()]).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(domain = %domain, timeline = %timeline, error = %e, "upstream open failed");
            return;
        }
    };
    debug!(domain = %domain, timeline = %timeline, "upstream opened");

    while let Some(mut event) = events.recv().await {
        let Some(inner) = hub.upgrade() else {
            return;
        };
        // Peers may send their bare form; subscribers hold the qualified one.
        if timeline_domain(&event.timeline).is_none() {
            event.timeline = format!("{}@{}", event.timeline, domain);
        }
        RealtimeHub { inner }.publish(&event);
    }
    debug!(domain = %domain, timeline = %timeline, "upstream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::memory::MemoryPeerNetwork;
    use std::time::Duration;

    fn event(timeline: &str, n: u32) -> Event {
        Event {
            timeline: timeline.to_string(),
            item: None,
            resource: None,
            document: format!("{{\"n\":{}}}", n),
            signature: "00".into(),
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_qualify() {
        let hub = RealtimeHub::new(HubConfig::default(), "a.example", None);
        assert_eq!(hub.qualify("t1"), "t1@a.example");
        assert_eq!(hub.qualify("t1@b.example"), "t1@b.example");
        assert_eq!(timeline_domain("t1"), None);
    }

    #[tokio::test]
    async fn test_events_follow_subscription() {
        let hub = RealtimeHub::new(HubConfig::default(), "a.example", None);
        let (req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(16);
        let task = tokio::spawn({
            let hub = hub.clone();
            async move { hub.realtime(req_rx, resp_tx).await }
        });

        req_tx.send(vec!["t1".into()]).await.unwrap();
        wait_for(|| hub.publish(&event("t1@a.example", 0)) == 1).await;
        assert_eq!(resp_rx.recv().await.unwrap().timeline, "t1@a.example");

        assert_eq!(hub.publish(&event("t2@a.example", 1)), 0);

        // Replacing the set drops t1.
        req_tx.send(vec!["t2".into()]).await.unwrap();
        wait_for(|| hub.publish(&event("t2@a.example", 2)) == 1).await;
        assert_eq!(hub.publish(&event("t1@a.example", 3)), 0);
        assert_eq!(resp_rx.recv().await.unwrap().document, "{\"n\":2}");

        drop(req_tx);
        task.await.unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let hub = RealtimeHub::new(HubConfig::default(), "a.example", None);
        let (req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(64);
        tokio::spawn({
            let hub = hub.clone();
            async move { hub.realtime(req_rx, resp_tx).await }
        });
        req_tx.send(vec!["t1".into()]).await.unwrap();
        wait_for(|| hub.publish(&event("t1@a.example", 0)) == 1).await;

        for n in 1..20 {
            hub.publish(&event("t1@a.example", n));
        }
        for n in 0..20 {
            let got = resp_rx.recv().await.unwrap();
            assert_eq!(got.document, format!("{{\"n\":{}}}", n));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_subscriber() {
        let hub = RealtimeHub::new(HubConfig::default(), "a.example", None);
        let (tx, _rx) = mpsc::channel(1);
        hub.inner.subscribers.write().insert(
            7,
            Subscriber {
                timelines: ["t1@a.example".to_string()].into_iter().collect(),
                tx,
            },
        );

        assert_eq!(hub.publish(&event("t1@a.example", 0)), 1);
        assert_eq!(hub.publish(&event("t1@a.example", 1)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_blocked_client_times_out() {
        let config = HubConfig {
            write_timeout: Duration::from_millis(20),
            queue_size: 8,
        };
        let hub = RealtimeHub::new(config, "a.example", None);
        let (req_tx, req_rx) = mpsc::channel(4);
        // Never drained: the second send blocks.
        let (resp_tx, _resp_rx) = mpsc::channel(1);
        let task = tokio::spawn({
            let hub = hub.clone();
            async move { hub.realtime(req_rx, resp_tx).await }
        });
        req_tx.send(vec!["t1".into()]).await.unwrap();
        wait_for(|| hub.publish(&event("t1@a.example", 0)) == 1).await;
        hub.publish(&event("t1@a.example", 1));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection should end")
            .unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_timelines_share_one_upstream() {
        let network = MemoryPeerNetwork::new();
        let hub = RealtimeHub::new(
            HubConfig::default(),
            "a.example",
            Some(Arc::new(network.client())),
        );

        let mut connections = Vec::new();
        for _ in 0..2 {
            let (req_tx, req_rx) = mpsc::channel(4);
            let (resp_tx, resp_rx) = mpsc::channel(16);
            let task = tokio::spawn({
                let hub = hub.clone();
                async move { hub.realtime(req_rx, resp_tx).await }
            });
            req_tx.send(vec!["t9@b.example".into()]).await.unwrap();
            connections.push((req_tx, resp_rx, task));
        }

        assert_eq!(
            network
                .wait_for_streams("b.example", 1, Duration::from_secs(1))
                .await,
            1
        );
        wait_for(|| hub.upstream_count() == 1).await;
        assert_eq!(network.push_event("b.example", &event("t9@b.example", 5)), 1);

        for (_, resp_rx, _) in connections.iter_mut() {
            let got = tokio::time::timeout(Duration::from_secs(1), resp_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.timeline, "t9@b.example");
        }

        for (req_tx, _, task) in connections {
            drop(req_tx);
            task.await.unwrap();
        }
        assert_eq!(hub.upstream_count(), 0);
        assert_eq!(
            network
                .wait_for_streams("b.example", 0, Duration::from_millis(100))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_failed_upstream_is_reopened() {
        let network = MemoryPeerNetwork::new();
        network.fail_next("b.example", 1);
        let hub = RealtimeHub::new(
            HubConfig::default(),
            "a.example",
            Some(Arc::new(network.client())),
        );

        let mut connections = Vec::new();
        for _ in 0..2 {
            let (req_tx, req_rx) = mpsc::channel(4);
            let (resp_tx, resp_rx) = mpsc::channel(16);
            let task = tokio::spawn({
                let hub = hub.clone();
                async move { hub.realtime(req_rx, resp_tx).await }
            });
            req_tx.send(vec!["t9@b.example".into()]).await.unwrap();
            // Let the first open fail before the second subscriber arrives.
            wait_for(|| hub.upstream_count() == 1).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            connections.push((req_tx, resp_rx, task));
        }

        assert_eq!(
            network
                .wait_for_streams("b.example", 1, Duration::from_secs(1))
                .await,
            1
        );
        assert_eq!(network.push_event("b.example", &event("t9@b.example", 1)), 1);
        for (_, resp_rx, _) in connections.iter_mut() {
            let got = tokio::time::timeout(Duration::from_secs(1), resp_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.timeline, "t9@b.example");
        }

        for (req_tx, _, task) in connections {
            drop(req_tx);
            task.await.unwrap();
        }
        assert_eq!(hub.upstream_count(), 0);
    }

    #[tokio::test]
    async fn test_refs_follow_subscriptions() {
        let network = MemoryPeerNetwork::new();
        let hub = RealtimeHub::new(
            HubConfig::default(),
            "a.example",
            Some(Arc::new(network.client())),
        );
        for id in [1, 2] {
            let (tx, _rx) = mpsc::channel(1);
            hub.inner.subscribers.write().insert(
                id,
                Subscriber {
                    timelines: HashSet::new(),
                    tx,
                },
            );
        }

        hub.resubscribe(1, vec!["t1@b.example".into(), "t2@b.example".into()]);
        hub.resubscribe(2, vec!["t1@b.example".into()]);
        hub.resubscribe(1, vec!["t2@b.example".into()]);
        assert_eq!(hub.upstream_count(), 2);
        assert_eq!(hub.inner.upstreams.lock()["t1@b.example"].refs, 1);

        hub.remove(2);
        assert_eq!(hub.upstream_count(), 1);
        hub.remove(1);
        hub.resubscribe(1, vec!["t3@b.example".into()]);
        assert_eq!(hub.upstream_count(), 0);
    }
}
