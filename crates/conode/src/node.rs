//! The Node: the commit pipeline and the read API of one domain.
//!
//! A commit moves through decode, key chain verification, idempotency,
//! planning by the record service, one store transaction, and finally
//! best-effort publication to realtime connections and peer domains.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use conode_core::{
    Cdid, Chunk, CommitLog, CommitMode, Document, DocumentKind, Event, TimelineItem,
};
use conode_fanout::{FanoutError, OutboundCommit, PeerClient, PeerDispatcher, RealtimeHub};
use conode_policy::PolicyEngine;
use conode_store::{ApplyResult, CommitBatch, Store};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ApiResponse, CommitRequest};
use crate::broker::TimelineBroker;
use crate::config::NodeConfig;
use crate::context::CommitContext;
use crate::error::{NodeError, Result};
use crate::keychain;
use crate::services::{self, Env, Plan};

/// What a commit call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    #[serde(rename = "documentID")]
    pub document_id: Cdid,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    /// The record as stored, or as it would be for a dry run.
    pub resource: Value,
    /// Whether a new record came into existence.
    pub created: bool,
    /// 201 for a new commit, 200 for a replay, a dry run or a no-op.
    pub status: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One domain's node.
///
/// Generic over the store so tests run against [`conode_store::MemoryStore`]
/// and deployments against [`conode_store::SqliteStore`].
pub struct Node<S: Store + 'static> {
    config: Arc<NodeConfig>,
    store: Arc<S>,
    policy: Arc<PolicyEngine>,
    broker: TimelineBroker<S>,
    hub: RealtimeHub,
    dispatcher: Option<PeerDispatcher>,
}

impl<S: Store + 'static> Node<S> {
    /// Create a node. Without a peer client it never talks to other domains.
    pub fn new(config: NodeConfig, store: S, peer: Option<Arc<dyn PeerClient>>) -> Self {
        let store = Arc::new(store);
        let policy = Arc::new(PolicyEngine::with_policies(config.policies.clone()));
        let broker = TimelineBroker::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&policy),
            peer.clone(),
        );
        let hub = RealtimeHub::new(config.hub.clone(), config.domain.clone(), peer.clone());
        let dispatcher = peer.map(|client| PeerDispatcher::new(client, config.dispatch.clone()));

        Self {
            config: Arc::new(config),
            store,
            policy,
            broker,
            hub,
            dispatcher,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broker(&self) -> &TimelineBroker<S> {
        &self.broker
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn dispatcher(&self) -> Option<&PeerDispatcher> {
        self.dispatcher.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept a signed document.
    ///
    /// `option` is opaque; it is only carried along when the commit is
    /// forwarded.
    pub async fn commit(
        &self,
        ctx: &CommitContext,
        mode: CommitMode,
        document: &str,
        signature: &str,
        option: Option<&str>,
    ) -> Result<CommitOutcome> {
        if ctx.is_expired() {
            return Err(NodeError::deadline_exceeded());
        }

        let now = Utc::now();
        let doc = Document::decode(document, now, self.config.signed_at_skew)?;
        let kind = doc.kind();
        let document_id = Cdid::from_content(document.as_bytes(), doc.signed_at());

        let chain = keychain::authenticate(self.store.as_ref(), document, signature, &doc).await?;

        if let Some(existing) = self.store.get_commit(&document_id).await? {
            return replayed(&existing, document);
        }

        if let Some(entity) = self.store.get_entity(doc.signer()).await? {
            if entity.is_tombstoned() {
                return Err(if kind == DocumentKind::Tombstone {
                    NodeError::AlreadyDeleted(format!("entity {}", entity.ccid))
                } else {
                    NodeError::PermissionDenied(format!("entity {} is tombstoned", entity.ccid))
                });
            }
        }

        let env = Env {
            store: self.store.as_ref(),
            config: &self.config,
            policy: &self.policy,
            broker: &self.broker,
            origin: &ctx.origin,
            raw: document,
            signature,
            document_id,
            chain: &chain,
            document: serde_json::from_str(document)?,
            claims: ctx.claims(),
        };
        let plan = services::plan(&env, &doc).await?;

        if !mode.writes() {
            debug!(document_id = %document_id, kind = %kind, "dry run");
            return Ok(outcome(document_id, kind, &plan, 200, Vec::new()));
        }
        if plan.unchanged {
            debug!(document_id = %document_id, kind = %kind, "equivalent record exists");
            return Ok(outcome(document_id, kind, &plan, 200, Vec::new()));
        }

        // Ephemeral documents leave no log entry, so replays are not detected.
        let log = (!doc.is_ephemeral()).then(|| CommitLog {
            id: 0,
            document_id,
            kind,
            document: document.to_string(),
            signature: signature.to_string(),
            signed_at: doc.signed_at(),
            owners: plan.owners.iter().cloned().collect(),
            is_ephemeral: false,
            result: Some(plan.resource.to_string()),
            cdate: now,
        });
        let batch = CommitBatch {
            log,
            mutations: plan.mutations.clone(),
            deadline: ctx.deadline,
        };

        match self.apply_with_retry(batch).await? {
            ApplyResult::Applied(_) | ApplyResult::Unlogged => {}
            // Lost a race with the same commit.
            ApplyResult::Duplicate(existing) => return replayed(&existing, document),
            ApplyResult::Conflict(_) => {
                return Err(NodeError::Conflict(format!("document {}", document_id)))
            }
        }

        if !plan.mutations.is_empty() {
            self.broker.invalidate(&plan.local_timelines);
        }
        for event in &plan.events {
            let delivered = self.hub.publish(event);
            debug!(timeline = %event.timeline, delivered, "event published");
        }

        let warnings = self
            .forward(ctx, mode, &doc, &plan, document_id, CommitRequest {
                document: document.to_string(),
                signature: signature.to_string(),
                option: option.map(str::to_string),
            })
            .await;

        info!(
            document_id = %document_id,
            kind = %kind,
            signer = %doc.signer(),
            mutations = plan.mutations.len(),
            events = plan.events.len(),
            "commit accepted"
        );
        Ok(outcome(document_id, kind, &plan, 201, warnings))
    }

    /// [`Node::commit`] with the HTTP status and envelope of the result.
    pub async fn handle_commit(
        &self,
        ctx: &CommitContext,
        mode: CommitMode,
        request: &CommitRequest,
    ) -> (u16, ApiResponse) {
        let result = self
            .commit(
                ctx,
                mode,
                &request.document,
                &request.signature,
                request.option.as_deref(),
            )
            .await;
        if let Err(e) = &result {
            debug!(error = %e, "commit rejected");
        }
        ApiResponse::from_commit(&result)
    }

    async fn apply_with_retry(&self, batch: CommitBatch) -> Result<ApplyResult> {
        let attempts = self.config.commit_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.apply_commit(batch.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let jitter = rand::thread_rng().gen_range(10..=50);
                    warn!(attempt, error = %e, "store busy, retrying commit");
                    tokio::time::sleep(StdDuration::from_millis(jitter)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue the commit for every peer that needs it.
    ///
    /// Never fails the commit; problems come back as warnings.
    async fn forward(
        &self,
        ctx: &CommitContext,
        mode: CommitMode,
        doc: &Document,
        plan: &Plan,
        document_id: Cdid,
        request: CommitRequest,
    ) -> Vec<String> {
        let mut targets: BTreeSet<String> = plan.remote_domains.clone();
        if !plan.local_timelines.is_empty() {
            let mut keys = plan.local_timelines.clone();
            keys.extend(
                plan.local_timelines
                    .iter()
                    .map(|t| format!("{}@{}", t, self.config.domain)),
            );
            match self.store.subscriber_domains(&keys).await {
                Ok(domains) => targets.extend(domains),
                Err(e) => warn!(document_id = %document_id, error = %e, "subscriber lookup failed"),
            }
        }
        targets.remove(&self.config.domain);
        if let Some(origin) = ctx.origin_domain() {
            targets.remove(origin);
        }
        if targets.is_empty() {
            return Vec::new();
        }

        let names = targets.iter().cloned().collect::<Vec<_>>().join(", ");
        if !mode.forwards() {
            debug!(document_id = %document_id, peers = %names, "peer delivery deferred");
            return vec![format!("peer delivery deferred: {}", names)];
        }
        let Some(dispatcher) = &self.dispatcher else {
            warn!(document_id = %document_id, peers = %names, "no peer client configured");
            return vec![format!("peer delivery unavailable: {}", names)];
        };

        let body = match serde_json::to_vec(&request) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "cannot encode commit for peers");
                return vec![format!("peer delivery failed: {}", e)];
            }
        };

        let mut warnings = Vec::new();
        for domain in targets {
            let outbound = OutboundCommit {
                domain: domain.clone(),
                body: body.clone(),
                traceparent: ctx.traceparent.clone(),
                is_ephemeral: doc.is_ephemeral(),
                document_id: document_id.to_string(),
            };
            match dispatcher.enqueue(outbound) {
                Ok(()) => {
                    debug!(document_id = %document_id, domain = %domain, "commit queued for peer")
                }
                Err(FanoutError::Overloaded(domain)) => {
                    warnings.push(format!("peer queue full: {}", domain));
                }
                Err(e) => {
                    warn!(
                        document_id = %document_id,
                        domain = %domain,
                        error = %e,
                        "peer enqueue failed"
                    );
                    warnings.push(format!("peer delivery failed: {}", domain));
                }
            }
        }
        warnings
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_commit(&self, document_id: &Cdid) -> Result<Option<CommitLog>> {
        Ok(self.store.get_commit(document_id).await?)
    }

    pub async fn recent_items(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        self.broker.recent_items(requester, timelines, until, limit).await
    }

    pub async fn immediate_items(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        self.broker
            .immediate_items(requester, timelines, since, limit)
            .await
    }

    pub async fn chunks(
        &self,
        requester: Option<&str>,
        timelines: &[String],
        pivot: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Chunk>> {
        self.broker.chunks(requester, timelines, pivot).await
    }

    /// Serve one realtime connection.
    ///
    /// Each request is normalized and filtered by read access before it
    /// replaces the connection's subscription. Remote timelines given by
    /// semantic id cannot be streamed and are dropped.
    pub async fn realtime(
        &self,
        requester: Option<String>,
        mut requests: mpsc::Receiver<Vec<String>>,
        responses: mpsc::Sender<Event>,
    ) {
        let (tx, rx) = mpsc::channel(4);
        let connection = self.hub.realtime(rx, responses);
        tokio::pin!(connection);

        loop {
            tokio::select! {
                _ = &mut connection => return,
                request = requests.recv() => {
                    let Some(timelines) = request else { break };
                    let readable = self.broker.readable(requester.as_deref(), &timelines).await;
                    let resolved = match readable {
                        Ok(list) => list
                            .into_iter()
                            .filter(|(_, t)| t.resolved.is_some())
                            .map(|(_, t)| t.qualified())
                            .collect(),
                        Err(e) => {
                            warn!(error = %e, "realtime request failed");
                            continue;
                        }
                    };
                    if tx.send(resolved).await.is_err() {
                        return;
                    }
                }
            }
        }

        drop(tx);
        connection.await;
    }
}

fn replayed(existing: &CommitLog, document: &str) -> Result<CommitOutcome> {
    if existing.document != document {
        return Err(NodeError::Conflict(format!("document {}", existing.document_id)));
    }
    debug!(document_id = %existing.document_id, "idempotent replay");
    let resource = existing
        .result
        .as_deref()
        .and_then(|r| serde_json::from_str(r).ok())
        .unwrap_or(Value::Null);
    Ok(CommitOutcome {
        document_id: existing.document_id,
        kind: existing.kind,
        resource,
        created: false,
        status: 200,
        warnings: Vec::new(),
    })
}

fn outcome(
    document_id: Cdid,
    kind: DocumentKind,
    plan: &Plan,
    status: u16,
    warnings: Vec<String>,
) -> CommitOutcome {
    CommitOutcome {
        document_id,
        kind,
        resource: plan.resource.clone(),
        created: plan.created && !plan.unchanged,
        status,
        warnings,
    }
}
