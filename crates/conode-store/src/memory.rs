//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use conode_core::{
    Ack, Association, AssociationKey, Cdid, CommitLog, Entity, Key, Message, Profile,
    ResourceKind, Subscription, SubscriptionItem, Timeline, TimelineItem, TypedId,
};

use crate::error::{Result, StoreError};
use crate::traits::{item_order, ApplyResult, CommitBatch, Mutation, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Commit log, indexed by surrogate id.
    commits: BTreeMap<i64, CommitLog>,

    /// document_id -> surrogate id.
    by_document: HashMap<Cdid, i64>,

    entities: HashMap<String, Entity>,
    keys: HashMap<String, Key>,
    messages: HashMap<TypedId, Message>,
    associations: HashMap<TypedId, Association>,

    /// Uniqueness index for associations.
    association_keys: HashMap<AssociationKey, TypedId>,

    profiles: HashMap<TypedId, Profile>,
    timelines: HashMap<TypedId, Timeline>,
    subscriptions: HashMap<TypedId, Subscription>,

    /// (subscription, subscribed timeline) -> item.
    subscription_items: BTreeMap<(String, String), SubscriptionItem>,

    /// (timeline_id, resource_id) -> item.
    items: HashMap<(String, TypedId), TimelineItem>,

    acks: HashMap<(String, String), Ack>,
    deletions: HashMap<String, Cdid>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::UpsertEntity(e) => match self.entities.get_mut(&e.ccid) {
                Some(existing) => {
                    existing.domain = e.domain;
                    existing.affiliation_document = e.affiliation_document;
                    existing.affiliation_signature = e.affiliation_signature;
                    existing.mdate = e.mdate;
                }
                None => {
                    self.entities.insert(e.ccid.clone(), e);
                }
            },
            Mutation::TombstoneEntity {
                ccid,
                document,
                signature,
                at,
            } => {
                if let Some(e) = self.entities.get_mut(&ccid) {
                    e.tombstone_document = Some(document);
                    e.tombstone_signature = Some(signature);
                    e.mdate = at;
                }
            }
            Mutation::InsertKey(k) => {
                self.keys.insert(k.id.clone(), k);
            }
            Mutation::RevokeKey {
                id,
                document,
                signature,
                revoked_at,
            } => {
                if let Some(k) = self.keys.get_mut(&id) {
                    k.revoke_document = Some(document);
                    k.revoke_signature = Some(signature);
                    k.revoked_at = Some(revoked_at);
                }
            }
            Mutation::InsertMessage(m) => {
                self.messages.insert(m.id, m);
            }
            Mutation::DeleteMessage(id) => {
                self.messages.remove(&id);
            }
            Mutation::InsertAssociation(a) => {
                let key = a.key();
                if !self.association_keys.contains_key(&key) {
                    self.association_keys.insert(key, a.id);
                    self.associations.insert(a.id, a);
                }
            }
            Mutation::DeleteAssociation(id) => {
                if let Some(a) = self.associations.remove(&id) {
                    self.association_keys.remove(&a.key());
                }
            }
            Mutation::UpsertProfile(mut p) => {
                if let Some(existing) = self.profiles.get(&p.id) {
                    p.cdate = existing.cdate;
                }
                self.profiles.insert(p.id, p);
            }
            Mutation::DeleteProfile(id) => {
                self.profiles.remove(&id);
            }
            Mutation::UpsertTimeline(mut t) => {
                if let Some(existing) = self.timelines.get(&t.id) {
                    t.cdate = existing.cdate;
                }
                self.timelines.insert(t.id, t);
            }
            Mutation::DeleteTimeline(id) => {
                self.timelines.remove(&id);
                let timeline_id = id.to_string();
                self.items.retain(|(tl, _), _| *tl != timeline_id);
            }
            Mutation::UpsertSubscription(mut s) => {
                if let Some(existing) = self.subscriptions.get(&s.id) {
                    s.cdate = existing.cdate;
                }
                self.subscriptions.insert(s.id, s);
            }
            Mutation::DeleteSubscription(id) => {
                self.subscriptions.remove(&id);
                let subscription = id.to_string();
                self.subscription_items
                    .retain(|(sub, _), _| *sub != subscription);
            }
            Mutation::InsertSubscriptionItem(item) => {
                self.subscription_items
                    .insert((item.subscription.clone(), item.id.clone()), item);
            }
            Mutation::DeleteSubscriptionItem { subscription, id } => {
                self.subscription_items.remove(&(subscription, id));
            }
            Mutation::InsertTimelineItem(item) => {
                self.items
                    .entry((item.timeline_id.clone(), item.resource_id))
                    .or_insert(item);
            }
            Mutation::DeleteTimelineItem {
                timeline_id,
                resource_id,
            } => {
                self.items.remove(&(timeline_id, resource_id));
            }
            Mutation::DeleteTimelineItemsForResource(resource_id) => {
                self.items.retain(|(_, r), _| *r != resource_id);
            }
            Mutation::UpsertAck(ack) => {
                self.acks.insert((ack.from.clone(), ack.to.clone()), ack);
            }
            Mutation::DeleteAck { from, to } => {
                self.acks.remove(&(from, to));
            }
            Mutation::RecordDeletion {
                target,
                document_id,
                ..
            } => {
                self.deletions.entry(target).or_insert(document_id);
            }
        }
    }

    fn items_in<'a>(&'a self, timelines: &'a [String]) -> impl Iterator<Item = &'a TimelineItem> {
        self.items
            .values()
            .filter(move |item| timelines.contains(&item.timeline_id))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn apply_commit(&self, batch: CommitBatch) -> Result<ApplyResult> {
        let mut inner = self.inner.write();
        let CommitBatch {
            log,
            mutations,
            deadline,
        } = batch;

        let Some(mut log) = log else {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(StoreError::DeadlineExceeded);
            }
            for mutation in mutations {
                inner.apply(mutation);
            }
            return Ok(ApplyResult::Unlogged);
        };

        if let Some(existing) = inner
            .by_document
            .get(&log.document_id)
            .and_then(|id| inner.commits.get(id))
        {
            return Ok(if existing.document == log.document {
                ApplyResult::Duplicate(existing.clone())
            } else {
                ApplyResult::Conflict(existing.clone())
            });
        }

        // Nothing has been written yet, so there is nothing to roll back.
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded);
        }

        log.id = inner.commits.keys().next_back().map_or(1, |id| id + 1);
        inner.by_document.insert(log.document_id, log.id);
        inner.commits.insert(log.id, log.clone());
        for mutation in mutations {
            inner.apply(mutation);
        }
        Ok(ApplyResult::Applied(log))
    }

    async fn get_commit(&self, document_id: &Cdid) -> Result<Option<CommitLog>> {
        let inner = self.inner.read();
        Ok(inner
            .by_document
            .get(document_id)
            .and_then(|id| inner.commits.get(id))
            .cloned())
    }

    async fn commits_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<CommitLog>> {
        let inner = self.inner.read();
        Ok(inner
            .commits
            .values()
            .rev()
            .filter(|log| log.owners.iter().any(|o| o == owner))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_entity(&self, ccid: &str) -> Result<Option<Entity>> {
        Ok(self.inner.read().entities.get(ccid).cloned())
    }

    async fn get_key(&self, id: &str) -> Result<Option<Key>> {
        Ok(self.inner.read().keys.get(id).cloned())
    }

    async fn get_message(&self, id: &TypedId) -> Result<Option<Message>> {
        Ok(self.inner.read().messages.get(id).cloned())
    }

    async fn get_association(&self, id: &TypedId) -> Result<Option<Association>> {
        Ok(self.inner.read().associations.get(id).cloned())
    }

    async fn find_association(&self, key: &AssociationKey) -> Result<Option<Association>> {
        let inner = self.inner.read();
        Ok(inner
            .association_keys
            .get(key)
            .and_then(|id| inner.associations.get(id))
            .cloned())
    }

    async fn associations_for_target(&self, target: &TypedId) -> Result<Vec<Association>> {
        let inner = self.inner.read();
        let mut rows: Vec<Association> = inner
            .associations
            .values()
            .filter(|a| a.target == *target)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (b.cdate, b.id.to_string()).cmp(&(a.cdate, a.id.to_string()))
        });
        Ok(rows)
    }

    async fn get_profile(&self, id: &TypedId) -> Result<Option<Profile>> {
        Ok(self.inner.read().profiles.get(id).cloned())
    }

    async fn get_timeline(&self, id: &TypedId) -> Result<Option<Timeline>> {
        Ok(self.inner.read().timelines.get(id).cloned())
    }

    async fn get_subscription(&self, id: &TypedId) -> Result<Option<Subscription>> {
        Ok(self.inner.read().subscriptions.get(id).cloned())
    }

    async fn find_semantic(
        &self,
        kind: ResourceKind,
        owner: &str,
        semantic_id: &str,
    ) -> Result<Option<TypedId>> {
        let inner = self.inner.read();
        let matches = |author: &str, sid: &Option<String>| {
            author == owner && sid.as_deref() == Some(semantic_id)
        };
        Ok(match kind {
            ResourceKind::Profile => inner
                .profiles
                .values()
                .find(|p| matches(&p.author, &p.semantic_id))
                .map(|p| p.id),
            ResourceKind::Timeline => inner
                .timelines
                .values()
                .find(|t| matches(&t.author, &t.semantic_id))
                .map(|t| t.id),
            ResourceKind::Subscription => inner
                .subscriptions
                .values()
                .find(|s| matches(&s.author, &s.semantic_id))
                .map(|s| s.id),
            ResourceKind::Message | ResourceKind::Association => None,
        })
    }

    async fn is_deleted(&self, target: &str) -> Result<bool> {
        Ok(self.inner.read().deletions.contains_key(target))
    }

    async fn subscription_items(&self, subscription: &str) -> Result<Vec<SubscriptionItem>> {
        let inner = self.inner.read();
        Ok(inner
            .subscription_items
            .values()
            .filter(|item| item.subscription == subscription)
            .cloned()
            .collect())
    }

    async fn subscriber_domains(&self, timelines: &[String]) -> Result<BTreeSet<String>> {
        let inner = self.inner.read();
        Ok(inner
            .subscription_items
            .values()
            .filter(|item| timelines.contains(&item.id))
            .filter_map(|item| item.subscriber_domain.clone())
            .collect())
    }

    async fn get_ack(&self, from: &str, to: &str) -> Result<Option<Ack>> {
        Ok(self
            .inner
            .read()
            .acks
            .get(&(from.to_string(), to.to_string()))
            .cloned())
    }

    async fn get_timeline_item(
        &self,
        timeline_id: &str,
        resource_id: &TypedId,
    ) -> Result<Option<TimelineItem>> {
        Ok(self
            .inner
            .read()
            .items
            .get(&(timeline_id.to_string(), *resource_id))
            .cloned())
    }

    async fn timeline_items_before(
        &self,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let inner = self.inner.read();
        let mut items: Vec<TimelineItem> = inner
            .items_in(timelines)
            .filter(|item| item.cdate.timestamp_millis() < until.timestamp_millis())
            .cloned()
            .collect();
        items.sort_by_key(|item| std::cmp::Reverse(item_order(item)));
        items.truncate(limit);
        Ok(items)
    }

    async fn timeline_items_since(
        &self,
        timelines: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let inner = self.inner.read();
        let mut items: Vec<TimelineItem> = inner
            .items_in(timelines)
            .filter(|item| item.cdate.timestamp_millis() >= since.timestamp_millis())
            .cloned()
            .collect();
        items.sort_by_key(item_order);
        items.truncate(limit);
        Ok(items)
    }

    async fn timeline_items_between(
        &self,
        timeline_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineItem>> {
        let inner = self.inner.read();
        let (start, end) = (start.timestamp_millis(), end.timestamp_millis());
        let mut items: Vec<TimelineItem> = inner
            .items
            .values()
            .filter(|item| item.timeline_id == timeline_id)
            .filter(|item| {
                let t = item.cdate.timestamp_millis();
                start <= t && t < end
            })
            .cloned()
            .collect();
        items.sort_by_key(|item| std::cmp::Reverse(item_order(item)));
        Ok(items)
    }
}
