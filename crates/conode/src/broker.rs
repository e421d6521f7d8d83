//! Timeline reads: paging, chunks and timeline id normalization.
//!
//! Local timelines are read from the store. Remote ones are read through
//! their host's chunk endpoint, one ten-minute window at a time. Closed
//! windows never change, so both kinds are cached once closed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use conode_core::{
    chunk_bounds, chunk_key, is_ccid, Chunk, ResourceKind, Timeline, TimelineItem, TypedId,
    CHUNK_SECONDS,
};
use conode_fanout::PeerClient;
use conode_policy::{Action, PolicyEngine, PolicyTarget, RequestContext};
use conode_store::{item_order, Store};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::access::{ensure_allowed, record_params};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// A timeline id resolved to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTimeline {
    /// The id as the host knows it: `t…` or `semantic@ccid`.
    pub id: String,
    /// Host domain.
    pub domain: String,
    /// The timeline's id, once known. Always set for local timelines.
    pub resolved: Option<TypedId>,
    pub is_local: bool,
}

impl NormalizedTimeline {
    /// The form used across domains and by the realtime hub: `t…@domain`.
    pub fn qualified(&self) -> String {
        match self.resolved {
            Some(id) => format!("{}@{}", id, self.domain),
            None => self.id.clone(),
        }
    }

    /// Key of this timeline's items in the local store.
    pub fn storage_key(&self) -> Option<String> {
        if self.is_local {
            self.resolved.map(|id| id.to_string())
        } else {
            None
        }
    }
}

type ChunkCacheKey = (String, String);

#[derive(Debug, Clone)]
struct CachedChunk {
    chunk: Chunk,
    cached_at: Instant,
    /// Insertion order, for eviction.
    seq: u64,
}

/// Reads across local and remote timelines.
pub struct TimelineBroker<S> {
    store: Arc<S>,
    policy: Arc<PolicyEngine>,
    peer: Option<Arc<dyn PeerClient>>,
    local_domain: String,
    chunk_grace: Duration,
    max_lookback: usize,
    cache: RwLock<HashMap<ChunkCacheKey, CachedChunk>>,
    cache_capacity: usize,
    cache_ttl: StdDuration,
    cache_seq: AtomicU64,
}

impl<S: Store> TimelineBroker<S> {
    pub fn new(
        config: &NodeConfig,
        store: Arc<S>,
        policy: Arc<PolicyEngine>,
        peer: Option<Arc<dyn PeerClient>>,
    ) -> Self {
        Self {
            store,
            policy,
            peer,
            local_domain: config.domain.clone(),
            chunk_grace: config.chunk_grace,
            max_lookback: config.max_chunk_lookback.max(1),
            cache: RwLock::new(HashMap::new()),
            cache_capacity: config.chunk_cache_capacity,
            cache_ttl: config.chunk_cache_ttl,
            cache_seq: AtomicU64::new(0),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Normalization
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve `t…`, `t…@domain` or `semantic@ccid` to its host.
    pub async fn normalize(&self, timeline: &str) -> Result<NormalizedTimeline> {
        let Some((head, tail)) = timeline.rsplit_once('@') else {
            let id = parse_timeline_id(timeline)?;
            return Ok(self.local(id));
        };

        if is_ccid(tail) {
            let entity = self
                .store
                .get_entity(tail)
                .await?
                .ok_or_else(|| NodeError::NotFound(format!("entity {}", tail)))?;
            if entity.domain != self.local_domain {
                return Ok(NormalizedTimeline {
                    id: timeline.to_string(),
                    domain: entity.domain,
                    resolved: None,
                    is_local: false,
                });
            }
            let id = self
                .store
                .find_semantic(ResourceKind::Timeline, tail, head)
                .await?
                .ok_or_else(|| NodeError::NotFound(format!("timeline {}", timeline)))?;
            return Ok(self.local(id));
        }

        let id = parse_timeline_id(head)?;
        if tail == self.local_domain {
            return Ok(self.local(id));
        }
        Ok(NormalizedTimeline {
            id: id.to_string(),
            domain: tail.to_string(),
            resolved: Some(id),
            is_local: false,
        })
    }

    fn local(&self, id: TypedId) -> NormalizedTimeline {
        NormalizedTimeline {
            id: id.to_string(),
            domain: self.local_domain.clone(),
            resolved: Some(id),
            is_local: true,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access
    // ─────────────────────────────────────────────────────────────────────────

    /// Check `action` on a local timeline for `requester`.
    pub async fn authorize(
        &self,
        timeline: &Timeline,
        requester: &str,
        action: Action,
        document: serde_json::Value,
    ) -> Result<()> {
        let ctx = RequestContext::new(requester, &self.local_domain)
            .with_entity(self.store.get_entity(requester).await?)
            .with_document(document);
        self.authorize_as(timeline, action, ctx)
    }

    /// [`Self::authorize`] for a requester context the caller already built.
    pub fn authorize_as(
        &self,
        timeline: &Timeline,
        action: Action,
        ctx: RequestContext,
    ) -> Result<()> {
        let mut ctx = ctx
            .with_self(serde_json::to_value(timeline)?, Some(timeline.author.clone()))
            .with_params(record_params(timeline.policy_params.as_deref())?);
        ctx.domain_owned = timeline.domain_owned;

        let policies: Vec<&str> = timeline.policy.as_deref().into_iter().collect();
        let decision = self
            .policy
            .decide(PolicyTarget::Timeline, action, &policies, &ctx);
        ensure_allowed(&decision, &format!("{} on timeline {}", action, timeline.id))
    }

    /// Normalize `timelines`, keeping those `requester` may read.
    ///
    /// Unknown timelines are dropped, as are local ones the read policy
    /// denies. Remote timelines are gated by their host.
    pub async fn readable(
        &self,
        requester: Option<&str>,
        timelines: &[String],
    ) -> Result<Vec<(String, NormalizedTimeline)>> {
        let mut out = Vec::with_capacity(timelines.len());
        for raw in timelines {
            let normalized = match self.normalize(raw).await {
                Ok(n) => n,
                Err(NodeError::NotFound(_)) | Err(NodeError::Malformed(_)) => {
                    debug!(timeline = %raw, "skipping unknown timeline");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(id) = normalized.resolved.filter(|_| normalized.is_local) {
                let Some(timeline) = self.store.get_timeline(&id).await? else {
                    debug!(timeline = %raw, "skipping unknown timeline");
                    continue;
                };
                let requester = requester.unwrap_or_default();
                if let Err(e) = self
                    .authorize(&timeline, requester, Action::Read, serde_json::Value::Null)
                    .await
                {
                    debug!(timeline = %raw, error = %e, "read denied");
                    continue;
                }
            }
            out.push((raw.clone(), normalized));
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Items
    // ─────────────────────────────────────────────────────────────────────────

    /// Up to `limit` items with `cdate < until`, newest first.
    pub async fn recent_items(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let targets = self.readable(requester, timelines).await?;
        let (local, remote) = split_local(&targets);

        let mut items = if local.is_empty() {
            Vec::new()
        } else {
            self.store.timeline_items_before(&local, until, limit).await?
        };

        for timeline in remote {
            let mut found = Vec::new();
            for step in 0..self.max_lookback {
                let pivot = until - Duration::seconds(CHUNK_SECONDS * step as i64);
                let Some(chunk) = self.remote_chunk_lenient(timeline, pivot).await else {
                    break;
                };
                found.extend(chunk.items.into_iter().filter(|i| i.cdate < until));
                if found.len() >= limit {
                    break;
                }
            }
            items.extend(found);
        }

        items.sort_by(|a, b| item_order(b).cmp(&item_order(a)));
        items.dedup();
        items.truncate(limit);
        Ok(items)
    }

    /// Up to `limit` items with `cdate >= since`, oldest first.
    pub async fn immediate_items(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let targets = self.readable(requester, timelines).await?;
        let (local, remote) = split_local(&targets);

        let mut items = if local.is_empty() {
            Vec::new()
        } else {
            self.store.timeline_items_since(&local, since, limit).await?
        };

        let now = Utc::now();
        for timeline in remote {
            let mut found = Vec::new();
            for step in 0..self.max_lookback {
                let pivot = since + Duration::seconds(CHUNK_SECONDS * step as i64);
                if pivot > now {
                    break;
                }
                let Some(chunk) = self.remote_chunk_lenient(timeline, pivot).await else {
                    break;
                };
                found.extend(chunk.items.into_iter().filter(|i| i.cdate >= since));
                if found.len() >= limit {
                    break;
                }
            }
            items.extend(found);
        }

        items.sort_by_key(item_order);
        items.dedup();
        items.truncate(limit);
        Ok(items)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chunks
    // ─────────────────────────────────────────────────────────────────────────

    /// The chunk at `pivot` of every readable timeline, keyed by the id as
    /// requested.
    pub async fn chunks(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        pivot: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Chunk>> {
        let mut out = BTreeMap::new();
        for (raw, timeline) in self.readable(requester, timelines).await? {
            let chunk = match timeline.storage_key() {
                Some(key) => self.local_chunk(&key, pivot).await?,
                None => self.remote_chunk(&timeline, pivot).await?,
            };
            out.insert(raw, chunk);
        }
        Ok(out)
    }

    /// Every item of a local timeline inside the window containing `pivot`.
    pub async fn local_chunk(&self, timeline_id: &str, pivot: DateTime<Utc>) -> Result<Chunk> {
        let key = chunk_key(pivot);
        let cache_key = (timeline_id.to_string(), key.clone());
        if let Some(chunk) = self.cached(&cache_key) {
            return Ok(chunk);
        }

        let (start, end) = chunk_bounds(&key)?;
        let items = self
            .store
            .timeline_items_between(timeline_id, start, end)
            .await?;
        let chunk = Chunk { key, items };
        if self.is_closed(end) {
            self.remember(cache_key, &chunk);
        }
        Ok(chunk)
    }

    async fn remote_chunk(
        &self,
        timeline: &NormalizedTimeline,
        pivot: DateTime<Utc>,
    ) -> Result<Chunk> {
        let key = chunk_key(pivot);
        let cache_key = (timeline.qualified(), key.clone());
        if let Some(chunk) = self.cached(&cache_key) {
            return Ok(chunk);
        }

        let peer = self.peer.as_ref().ok_or_else(|| {
            NodeError::Unavailable(format!("no peer client for {}", timeline.domain))
        })?;
        let mut fetched = match peer.fetch_chunks(&timeline.domain, &timeline.id, pivot).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(
                    domain = %timeline.domain,
                    timeline = %timeline.id,
                    error = %e,
                    "chunk fetch failed"
                );
                return Err(e.into());
            }
        };

        // Hosts answer keyed by timeline id; a single-timeline answer may use
        // any key.
        let chunk = fetched
            .remove(&timeline.id)
            .or_else(|| fetched.into_values().next())
            .unwrap_or_else(|| Chunk {
                key: key.clone(),
                items: Vec::new(),
            });

        let (_, end) = chunk_bounds(&key)?;
        if self.is_closed(end) {
            self.remember(cache_key, &chunk);
        }
        Ok(chunk)
    }

    /// [`Self::remote_chunk`] for paged reads, where an unreachable host
    /// only loses its own items.
    async fn remote_chunk_lenient(
        &self,
        timeline: &NormalizedTimeline,
        pivot: DateTime<Utc>,
    ) -> Option<Chunk> {
        match self.remote_chunk(timeline, pivot).await {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                warn!(timeline = %timeline.qualified(), error = %e, "skipping remote timeline");
                None
            }
        }
    }

    fn cached(&self, cache_key: &ChunkCacheKey) -> Option<Chunk> {
        self.cache
            .read()
            .get(cache_key)
            .filter(|c| c.cached_at.elapsed() < self.cache_ttl)
            .map(|c| c.chunk.clone())
    }

    /// Cache a closed chunk. Expired entries go first, then the oldest
    /// ones until there is room.
    fn remember(&self, cache_key: ChunkCacheKey, chunk: &Chunk) {
        if self.cache_capacity == 0 {
            return;
        }
        let mut cache = self.cache.write();
        let ttl = self.cache_ttl;
        cache.retain(|_, c| c.cached_at.elapsed() < ttl);
        while cache.len() >= self.cache_capacity && !cache.contains_key(&cache_key) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, c)| c.seq)
                .map(|(k, _)| k.clone());
            let Some(oldest) = oldest else { break };
            debug!(timeline = %oldest.0, chunk = %oldest.1, "evicting cached chunk");
            cache.remove(&oldest);
        }
        cache.insert(
            cache_key,
            CachedChunk {
                chunk: chunk.clone(),
                cached_at: Instant::now(),
                seq: self.cache_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    fn is_closed(&self, end: DateTime<Utc>) -> bool {
        end + self.chunk_grace < Utc::now()
    }

    /// Forget cached chunks of local timelines after a write reached them.
    pub fn invalidate(&self, timelines: &[String]) {
        if timelines.is_empty() {
            return;
        }
        self.cache
            .write()
            .retain(|(timeline, _), _| !timelines.iter().any(|t| t == timeline));
    }

    pub fn cached_chunks(&self) -> usize {
        self.cache.read().len()
    }
}

fn parse_timeline_id(raw: &str) -> Result<TypedId> {
    let id = TypedId::parse(raw)?;
    if id.kind() != ResourceKind::Timeline {
        return Err(NodeError::Malformed(format!("{} is not a timeline id", raw)));
    }
    Ok(id)
}

fn split_local(
    targets: &[(String, NormalizedTimeline)],
) -> (Vec<String>, Vec<&NormalizedTimeline>) {
    let mut local = Vec::new();
    let mut remote = Vec::new();
    for (_, timeline) in targets {
        match timeline.storage_key() {
            Some(key) => local.push(key),
            None => remote.push(timeline),
        }
    }
    (local, remote)
}
