//! Peer client abstraction.
//!
//! A peer is another domain's node. We post signed commits to it, fetch
//! closed timeline chunks from it, and hold realtime streams open against it.

use std::collections::BTreeMap;
use std::fmt::Display;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conode_core::{Chunk, Event};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::{FanoutError, Result};

/// Header carrying W3C trace context to peers.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Buffer between an upstream socket and its consumer.
const STREAM_BUFFER: usize = 64;

/// A peer's answer to a forwarded commit, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Bytes,
}

impl PeerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx: the peer rejected the commit and retrying will not help.
    pub fn is_rejection(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Transport to other domains.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// POST a commit body to `domain`'s commit endpoint.
    async fn commit(
        &self,
        domain: &str,
        body: Bytes,
        traceparent: Option<&str>,
    ) -> Result<PeerResponse>;

    /// Chunks of `timeline` at `pivot`, keyed by chunk key.
    async fn fetch_chunks(
        &self,
        domain: &str,
        timeline: &str,
        pivot: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Chunk>>;

    /// Open a realtime stream on `domain` for `timelines`.
    ///
    /// The stream ends when the receiver is dropped or the peer disconnects.
    async fn open_stream(&self, domain: &str, timelines: Vec<String>)
        -> Result<mpsc::Receiver<Event>>;
}

#[derive(Deserialize)]
struct ChunksBody {
    chunks: BTreeMap<String, Chunk>,
}

/// PeerClient over HTTPS and secure websockets.
pub struct HttpPeerClient {
    http: reqwest::Client,
    scheme: String,
}

impl HttpPeerClient {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FanoutError::Client(e.to_string()))?;
        Ok(Self {
            http,
            scheme: config.scheme.clone(),
        })
    }

    fn url(&self, domain: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, domain, path)
    }

    fn ws_url(&self, domain: &str) -> String {
        let scheme = if self.scheme == "http" { "ws" } else { "wss" };
        format!("{}://{}/api/v1/realtime", scheme, domain)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn commit(
        &self,
        domain: &str,
        body: Bytes,
        traceparent: Option<&str>,
    ) -> Result<PeerResponse> {
        let mut request = self
            .http
            .post(self.url(domain, "/api/v1/commit"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(tp) = traceparent {
            request = request.header(TRACEPARENT_HEADER, tp);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FanoutError::unavailable(domain, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| FanoutError::unavailable(domain, e))?;
        Ok(PeerResponse { status, body })
    }

    async fn fetch_chunks(
        &self,
        domain: &str,
        timeline: &str,
        pivot: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Chunk>> {
        let response = self
            .http
            .get(self.url(domain, &format!("/api/v1/timelines/{}/chunks", timeline)))
            .query(&[("pivot", pivot.timestamp_millis().to_string())])
            .send()
            .await
            .map_err(|e| FanoutError::unavailable(domain, e))?;
        if !response.status().is_success() {
            return Err(FanoutError::unavailable(
                domain,
                format!("chunk fetch returned {}", response.status()),
            ));
        }
        let body: ChunksBody = response
            .json()
            .await
            .map_err(|e| FanoutError::invalid(domain, e))?;
        Ok(body.chunks)
    }

    async fn open_stream(
        &self,
        domain: &str,
        timelines: Vec<String>,
    ) -> Result<mpsc::Receiver<Event>> {
        let (socket, _) = tokio_tungstenite::connect_async(self.ws_url(domain))
            .await
            .map_err(|e| FanoutError::unavailable(domain, e))?;
        let (mut sink, mut stream) = socket.split();

        let request =
            serde_json::to_string(&timelines).map_err(|e| FanoutError::invalid(domain, e))?;
        sink.send(WsMessage::Text(request))
            .await
            .map_err(|e| FanoutError::unavailable(domain, e))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_upstream(domain.to_string(), stream, sink, tx));
        Ok(rx)
    }
}

/// Forward events from an upstream socket to `tx` until the socket ends or
/// the receiving side is dropped.
async fn pump_upstream<St, Si, E>(
    domain: String,
    mut stream: St,
    mut sink: Si,
    tx: mpsc::Sender<Event>,
)
where
    St: Stream<Item = std::result::Result<WsMessage, E>> + Unpin,
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                debug!(domain = %domain, "upstream receiver dropped");
                break;
            }
            frame = stream.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Ping(data))) => {
                if let Err(e) = sink.send(WsMessage::Pong(data)).await {
                    warn!(domain = %domain, error = %e, "upstream pong failed");
                    break;
                }
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(domain = %domain, error = %e, "upstream stream failed");
                break;
            }
        };
        match serde_json::from_str::<Event>(&text) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!(domain = %domain, error = %e, "skipping unreadable event"),
        }
    }
    if let Err(e) = sink.close().await {
        debug!(domain = %domain, error = %e, "upstream close failed");
    }
}

/// An in-process peer network for testing.
///
/// Records every forwarded commit, serves canned chunks, and lets tests push
/// events into open streams.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// One commit received by a simulated peer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCommit {
        pub domain: String,
        pub body: Bytes,
        pub traceparent: Option<String>,
    }

    struct Stream {
        domain: String,
        timelines: Vec<String>,
        tx: mpsc::Sender<Event>,
    }

    #[derive(Default)]
    struct State {
        commits: Vec<RecordedCommit>,
        /// Requests to fail before succeeding, per domain.
        failures: HashMap<String, usize>,
        /// Fixed status to answer with, per domain.
        statuses: HashMap<String, u16>,
        chunks: HashMap<(String, String), BTreeMap<String, Chunk>>,
        streams: Vec<Stream>,
    }

    /// Shared state for a simulated federation.
    #[derive(Default)]
    pub struct MemoryPeerNetwork {
        state: Mutex<State>,
        changed: Notify,
    }

    impl MemoryPeerNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A client whose requests land on this network.
        pub fn client(self: &Arc<Self>) -> MemoryPeerClient {
            MemoryPeerClient {
                network: Arc::clone(self),
            }
        }

        /// Fail the next `n` requests to `domain` as unreachable.
        pub fn fail_next(&self, domain: &str, n: usize) {
            self.state.lock().failures.insert(domain.to_string(), n);
        }

        /// Answer every commit to `domain` with `status`.
        pub fn respond_with(&self, domain: &str, status: u16) {
            self.state.lock().statuses.insert(domain.to_string(), status);
        }

        pub fn set_chunks(&self, domain: &str, timeline: &str, chunks: BTreeMap<String, Chunk>) {
            self.state
                .lock()
                .chunks
                .insert((domain.to_string(), timeline.to_string()), chunks);
        }

        pub fn commits(&self) -> Vec<RecordedCommit> {
            self.state.lock().commits.clone()
        }

        pub fn commits_to(&self, domain: &str) -> Vec<RecordedCommit> {
            self.state
                .lock()
                .commits
                .iter()
                .filter(|c| c.domain == domain)
                .cloned()
                .collect()
        }

        /// Open streams on `domain` whose consumer is still alive.
        pub fn open_streams(&self, domain: &str) -> usize {
            let mut state = self.state.lock();
            state.streams.retain(|s| !s.tx.is_closed());
            state.streams.iter().filter(|s| s.domain == domain).count()
        }

        /// Deliver `event` to every open stream on `domain` listening to its timeline.
        pub fn push_event(&self, domain: &str, event: &Event) -> usize {
            let mut state = self.state.lock();
            state.streams.retain(|s| !s.tx.is_closed());
            state
                .streams
                .iter()
                .filter(|s| s.domain == domain && s.timelines.contains(&event.timeline))
                .filter(|s| s.tx.try_send(event.clone()).is_ok())
                .count()
        }

        /// Wait until `domain` has received at least `n` commits.
        pub async fn wait_for_commits(
            &self,
            domain: &str,
            n: usize,
            timeout: Duration,
        ) -> Vec<RecordedCommit> {
            self.wait_until(timeout, || self.commits_to(domain).len() >= n)
                .await;
            self.commits_to(domain)
        }

        /// Wait until `domain` has at least `n` open streams.
        pub async fn wait_for_streams(&self, domain: &str, n: usize, timeout: Duration) -> usize {
            self.wait_until(timeout, || self.open_streams(domain) >= n)
                .await;
            self.open_streams(domain)
        }

        async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) {
            let deadline = tokio::time::Instant::now() + timeout;
            while !done() && tokio::time::Instant::now() < deadline {
                // Streams close without notifying, so poll as well.
                let _ =
                    tokio::time::timeout(Duration::from_millis(10), self.changed.notified()).await;
            }
        }
    }

    /// PeerClient backed by a [`MemoryPeerNetwork`].
    pub struct MemoryPeerClient {
        network: Arc<MemoryPeerNetwork>,
    }

    #[async_trait]
    impl PeerClient for MemoryPeerClient {
        async fn commit(
            &self,
            domain: &str,
            body: Bytes,
            traceparent: Option<&str>,
        ) -> Result<PeerResponse> {
            let status = {
                let mut state = self.network.state.lock();
                if let Some(remaining) = state.failures.get_mut(domain) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(FanoutError::unavailable(domain, "simulated outage"));
                    }
                }
                state.commits.push(RecordedCommit {
                    domain: domain.to_string(),
                    body,
                    traceparent: traceparent.map(String::from),
                });
                state.statuses.get(domain).copied().unwrap_or(200)
            };
            self.network.changed.notify_waiters();
            Ok(PeerResponse {
                status,
                body: Bytes::from_static(b"{\"status\":\"ok\"}"),
            })
        }

        async fn fetch_chunks(
            &self,
            domain: &str,
            timeline: &str,
            _pivot: DateTime<Utc>,
        ) -> Result<BTreeMap<String, Chunk>> {
            let state = self.network.state.lock();
            state
                .chunks
                .get(&(domain.to_string(), timeline.to_string()))
                .cloned()
                .ok_or_else(|| FanoutError::unavailable(domain, "no such timeline"))
        }

        async fn open_stream(
            &self,
            domain: &str,
            timelines: Vec<String>,
        ) -> Result<mpsc::Receiver<Event>> {
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            {
                let mut state = self.network.state.lock();
                if let Some(remaining) = state.failures.get_mut(domain) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(FanoutError::unavailable(domain, "simulated outage"));
                    }
                }
                state.streams.push(Stream {
                    domain: domain.to_string(),
                    timelines,
                    tx,
                });
            }
            self.network.changed.notify_waiters();
            Ok(rx)
        }
    }
}
