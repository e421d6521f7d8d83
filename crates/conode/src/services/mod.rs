//! Record services: what each document type writes.
//!
//! A service never touches the store's write path. It reads what it needs,
//! authorizes, and returns a [`Plan`]: the mutations for the commit
//! transaction, the owners to log, the events to publish and the peer
//! domains that must hear about the commit.

mod ack;
mod association;
mod delete;
mod entity;
mod event;
mod key;
mod message;
mod profile;
mod subscription;
mod timeline;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use conode_core::{Cdid, Document, Event, ResourceKind, TimelineItem, TypedId};
use conode_policy::{Action, PolicyEngine, PolicyTarget, RequestContext, RequesterClaims};
use conode_store::{Mutation, Store};
use serde::Serialize;
use serde_json::Value;

use crate::access::{ensure_allowed, record_params};
use crate::broker::{NormalizedTimeline, TimelineBroker};
use crate::config::NodeConfig;
use crate::context::Origin;
use crate::error::{NodeError, Result};
use crate::keychain::KeyChain;

/// Everything a commit does once accepted.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// The record returned to the caller.
    pub resource: Value,
    pub mutations: Vec<Mutation>,
    pub owners: BTreeSet<String>,
    /// Events for the realtime hub, on qualified timeline ids.
    pub events: Vec<Event>,
    /// Peers named by the record itself.
    pub remote_domains: BTreeSet<String>,
    /// Storage keys of local timelines the commit touches.
    pub local_timelines: Vec<String>,
    pub created: bool,
    /// An equivalent record already exists; nothing is written.
    pub unchanged: bool,
}

impl Plan {
    fn new(resource: impl Serialize) -> Result<Self> {
        Ok(Self {
            resource: serde_json::to_value(resource)?,
            ..Self::default()
        })
    }

    fn unchanged(resource: impl Serialize) -> Result<Self> {
        let mut plan = Self::new(resource)?;
        plan.unchanged = true;
        Ok(plan)
    }

    fn owner(&mut self, ccid: impl Into<String>) -> &mut Self {
        self.owners.insert(ccid.into());
        self
    }

    fn touch(&mut self, timeline: &NormalizedTimeline) {
        if let Some(key) = timeline.storage_key() {
            if !self.local_timelines.contains(&key) {
                self.local_timelines.push(key);
            }
        }
    }
}

/// What a service may look at while planning.
pub struct Env<'a, S> {
    pub store: &'a S,
    pub config: &'a NodeConfig,
    pub policy: &'a PolicyEngine,
    pub broker: &'a TimelineBroker<S>,
    pub origin: &'a Origin,
    pub raw: &'a str,
    pub signature: &'a str,
    pub document_id: Cdid,
    pub chain: &'a KeyChain,
    /// The document as JSON, for policy expressions.
    pub document: Value,
    pub claims: RequesterClaims,
}

impl<'a, S: Store> Env<'a, S> {
    fn id(&self, kind: ResourceKind) -> TypedId {
        TypedId::new(kind, self.document_id)
    }

    fn event(
        &self,
        timeline: &NormalizedTimeline,
        item: Option<TimelineItem>,
        resource: &Value,
    ) -> Event {
        Event {
            timeline: timeline.qualified(),
            item,
            resource: Some(resource.clone()),
            document: self.raw.to_string(),
            signature: self.signature.to_string(),
        }
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.config.domain
    }

    /// Only the domain's own key may mark a record domain-owned.
    fn ensure_domain_owner(&self, domain_owned: bool) -> Result<()> {
        if !domain_owned || self.config.domain_ccid.as_deref() == Some(self.chain.root.as_str()) {
            return Ok(());
        }
        Err(NodeError::PermissionDenied(format!(
            "only the key of {} may set domainOwned",
            self.config.domain
        )))
    }

    /// Home domain of `ccid` when it is known and not this one.
    async fn remote_home(&self, ccid: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_entity(ccid)
            .await?
            .map(|e| e.domain)
            .filter(|d| !self.is_local_domain(d)))
    }

    async fn context(&self, requester: &str) -> Result<RequestContext> {
        let mut ctx = RequestContext::new(requester, &self.config.domain)
            .with_entity(self.store.get_entity(requester).await?)
            .with_document(self.document.clone())
            .with_claims(self.claims.clone());
        ctx.registration_open = self.config.registration_open;
        Ok(ctx)
    }

    /// Check `action` on an existing record.
    async fn authorize_record(
        &self,
        target: PolicyTarget,
        action: Action,
        record: &RecordView,
    ) -> Result<()> {
        let mut ctx = self
            .context(self.chain.root.as_str())
            .await?
            .with_self(record.value.clone(), Some(record.owner.clone()))
            .with_params(record_params(record.policy_params.as_deref())?);
        ctx.target_owner = record.target_owner.clone();
        ctx.domain_owned = record.domain_owned;

        let policies: Vec<&str> = record.policy.as_deref().into_iter().collect();
        let decision = self.policy.decide(target, action, &policies, &ctx);
        ensure_allowed(&decision, &format!("{} on {} {}", action, target, record.id))
    }
}

/// The fields of any stored record that policy and deletion care about.
#[derive(Debug, Clone)]
pub(crate) struct RecordView {
    pub id: TypedId,
    pub value: Value,
    pub owner: String,
    /// Owner of what an association points at.
    pub target_owner: Option<String>,
    pub policy: Option<String>,
    pub policy_params: Option<String>,
    pub domain_owned: bool,
    pub timelines: Vec<String>,
    pub cdate: DateTime<Utc>,
    /// Signing time of the document that last wrote the record.
    pub mdate: DateTime<Utc>,
}

impl RecordView {
    /// Whether the stored record was written by a document signed after
    /// `signed_at`.
    pub fn is_newer_than(&self, signed_at: DateTime<Utc>) -> bool {
        self.mdate > signed_at
    }
}

pub(crate) fn policy_target(kind: ResourceKind) -> PolicyTarget {
    match kind {
        ResourceKind::Message => PolicyTarget::Message,
        ResourceKind::Association => PolicyTarget::Association,
        ResourceKind::Profile => PolicyTarget::Profile,
        ResourceKind::Timeline => PolicyTarget::Timeline,
        ResourceKind::Subscription => PolicyTarget::Subscription,
    }
}

pub(crate) async fn load_record<S: Store + ?Sized>(
    store: &S,
    id: &TypedId,
) -> Result<Option<RecordView>> {
    let view = match id.kind() {
        ResourceKind::Message => store.get_message(id).await?.map(|m| RecordView {
            id: *id,
            owner: m.author.clone(),
            target_owner: None,
            policy: m.policy.clone(),
            policy_params: m.policy_params.clone(),
            domain_owned: false,
            timelines: m.timelines.clone(),
            cdate: m.cdate,
            mdate: m.cdate,
            value: serde_json::to_value(&m).unwrap_or(Value::Null),
        }),
        ResourceKind::Association => store.get_association(id).await?.map(|a| RecordView {
            id: *id,
            owner: a.author.clone(),
            target_owner: Some(a.owner.clone()),
            policy: None,
            policy_params: None,
            domain_owned: false,
            timelines: a.timelines.clone(),
            cdate: a.cdate,
            mdate: a.cdate,
            value: serde_json::to_value(&a).unwrap_or(Value::Null),
        }),
        ResourceKind::Profile => store.get_profile(id).await?.map(|p| RecordView {
            id: *id,
            owner: p.author.clone(),
            target_owner: None,
            policy: p.policy.clone(),
            policy_params: p.policy_params.clone(),
            domain_owned: false,
            timelines: Vec::new(),
            cdate: p.cdate,
            mdate: p.mdate,
            value: serde_json::to_value(&p).unwrap_or(Value::Null),
        }),
        ResourceKind::Timeline => store.get_timeline(id).await?.map(|t| RecordView {
            id: *id,
            owner: t.author.clone(),
            target_owner: None,
            policy: t.policy.clone(),
            policy_params: t.policy_params.clone(),
            domain_owned: t.domain_owned,
            timelines: vec![t.id.to_string()],
            cdate: t.cdate,
            mdate: t.mdate,
            value: serde_json::to_value(&t).unwrap_or(Value::Null),
        }),
        ResourceKind::Subscription => store.get_subscription(id).await?.map(|s| RecordView {
            id: *id,
            owner: s.author.clone(),
            target_owner: None,
            policy: s.policy.clone(),
            policy_params: s.policy_params.clone(),
            domain_owned: s.domain_owned,
            timelines: Vec::new(),
            cdate: s.cdate,
            mdate: s.mdate,
            value: serde_json::to_value(&s).unwrap_or(Value::Null),
        }),
    };
    Ok(view)
}

/// Where a mutable record write lands.
///
/// An explicit `id` must name an existing record; a `semanticID` reuses the
/// signer's record with that id, if any; otherwise the record is new.
async fn resolve_mutable<S: Store>(
    env: &Env<'_, S>,
    kind: ResourceKind,
    explicit: Option<&str>,
    semantic_id: Option<&str>,
    owner: &str,
) -> Result<(TypedId, Option<RecordView>)> {
    if let Some(raw) = explicit.filter(|s| !s.is_empty()) {
        let id = TypedId::parse(raw)?;
        if id.kind() != kind {
            return Err(NodeError::Malformed(format!("id: {} is not a {} id", raw, kind.as_str())));
        }
        let existing = load_record(env.store, &id)
            .await?
            .ok_or_else(|| NodeError::NotFound(format!("{} {}", kind.as_str(), raw)))?;
        return Ok((id, Some(existing)));
    }

    if let Some(semantic_id) = semantic_id.filter(|s| !s.is_empty()) {
        if let Some(id) = env.store.find_semantic(kind, owner, semantic_id).await? {
            let existing = load_record(env.store, &id).await?;
            return Ok((id, existing));
        }
    }

    Ok((env.id(kind), None))
}

/// Plan the commit of `doc`.
pub async fn plan<S: Store>(env: &Env<'_, S>, doc: &Document) -> Result<Plan> {
    match doc {
        Document::Message(d) => message::create(env, d).await,
        Document::Association(d) => association::create(env, d).await,
        Document::Profile(d) => profile::upsert(env, d).await,
        Document::Timeline(d) => timeline::upsert(env, d).await,
        Document::Subscription(d) => subscription::upsert(env, d).await,
        Document::Subscribe(d) => subscription::subscribe(env, d).await,
        Document::Unsubscribe(d) => subscription::unsubscribe(env, d).await,
        Document::Ack(d) => ack::ack(env, d).await,
        Document::Unack(d) => ack::unack(env, d).await,
        Document::Enact(d) => key::enact(env, d).await,
        Document::Revoke(d) => key::revoke(env, d).await,
        Document::Affiliation(d) => entity::affiliate(env, d).await,
        Document::Tombstone(d) => entity::tombstone(env, d).await,
        Document::Delete(d) => delete::delete(env, d).await,
        Document::Retract(d) => delete::retract(env, d).await,
        Document::Event(d) => event::publish(env, d).await,
    }
}

/// Place a new resource on the listed timelines.
///
/// Local timelines must exist and allow `post` for the signer. Remote ones
/// are left to their host.
async fn post_to_timelines<S: Store>(
    env: &Env<'_, S>,
    plan: &mut Plan,
    resource_id: TypedId,
    owner: &str,
    schema: &str,
    cdate: DateTime<Utc>,
    timelines: &[String],
) -> Result<()> {
    let signer = env.chain.root.as_str();
    let mut seen = BTreeSet::new();
    for raw in timelines {
        let target = env.broker.normalize(raw).await?;
        if !seen.insert(target.qualified()) {
            continue;
        }
        let (Some(id), true) = (target.resolved, target.is_local) else {
            plan.remote_domains.insert(target.domain.clone());
            continue;
        };

        let timeline = env
            .store
            .get_timeline(&id)
            .await?
            .ok_or_else(|| NodeError::NotFound(format!("timeline {}", raw)))?;
        env.broker
            .authorize_as(&timeline, Action::Post, env.context(signer).await?)?;

        let item = TimelineItem {
            resource_id,
            timeline_id: id.to_string(),
            owner: owner.to_string(),
            author: Some(signer.to_string()),
            schema: schema.to_string(),
            cdate,
        };
        plan.owner(timeline.author.clone());
        plan.mutations.push(Mutation::InsertTimelineItem(item.clone()));
        plan.events.push(env.event(&target, Some(item), &plan.resource));
        plan.touch(&target);
    }
    Ok(())
}
