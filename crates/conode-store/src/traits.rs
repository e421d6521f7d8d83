//! Store trait: the abstract interface for commit persistence.
//!
//! Writes go through a single entry point, [`Store::apply_commit`], which
//! appends the commit log and applies every derived-state [`Mutation`] in one
//! transaction. Reads are individual, non-transactional lookups.

use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conode_core::{
    Ack, Association, AssociationKey, Cdid, CommitLog, Entity, Key, Message, Profile,
    ResourceKind, Subscription, SubscriptionItem, Timeline, TimelineItem, TypedId,
};

use crate::error::Result;

/// A change to derived state, applied inside the commit transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertEntity(Entity),
    TombstoneEntity {
        ccid: String,
        document: String,
        signature: String,
        at: DateTime<Utc>,
    },
    InsertKey(Key),
    RevokeKey {
        id: String,
        document: String,
        signature: String,
        revoked_at: DateTime<Utc>,
    },
    InsertMessage(Message),
    DeleteMessage(TypedId),
    /// Ignored when an association with the same key already exists.
    InsertAssociation(Association),
    DeleteAssociation(TypedId),
    UpsertProfile(Profile),
    DeleteProfile(TypedId),
    UpsertTimeline(Timeline),
    /// Also removes the timeline's items.
    DeleteTimeline(TypedId),
    UpsertSubscription(Subscription),
    /// Also removes the subscription's items.
    DeleteSubscription(TypedId),
    InsertSubscriptionItem(SubscriptionItem),
    DeleteSubscriptionItem {
        subscription: String,
        id: String,
    },
    InsertTimelineItem(TimelineItem),
    DeleteTimelineItem {
        timeline_id: String,
        resource_id: TypedId,
    },
    DeleteTimelineItemsForResource(TypedId),
    UpsertAck(Ack),
    DeleteAck {
        from: String,
        to: String,
    },
    /// Tombstone for a deleted record, so a repeated delete is detectable.
    RecordDeletion {
        target: String,
        document_id: Cdid,
        at: DateTime<Utc>,
    },
}

/// Everything one accepted commit writes.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// The log entry; `id` is assigned by the store. Ephemeral commits
    /// carry none and only apply their mutations.
    pub log: Option<CommitLog>,
    pub mutations: Vec<Mutation>,
    /// Checked again right before the transaction commits.
    pub deadline: Option<Instant>,
}

/// Result of applying a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// New commit, with its assigned surrogate id.
    Applied(CommitLog),
    /// Mutations of a batch without a log entry were applied.
    Unlogged,
    /// The same document was already committed (idempotent - not an error).
    Duplicate(CommitLog),
    /// A different document already holds this document id.
    Conflict(CommitLog),
}

/// The Store trait: async interface for commit persistence.
///
/// For SQLite, work runs on `spawn_blocking` to avoid blocking the runtime.
///
/// # Ordering
///
/// Timeline item queries order by `cdate`, breaking ties by resource id and
/// then timeline id, so pages are deterministic regardless of insert order.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Commit Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a commit and apply its mutations atomically.
    async fn apply_commit(&self, batch: CommitBatch) -> Result<ApplyResult>;

    async fn get_commit(&self, document_id: &Cdid) -> Result<Option<CommitLog>>;

    /// Most recent commits with `owner` among their owners.
    async fn commits_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<CommitLog>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Entities and Keys
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_entity(&self, ccid: &str) -> Result<Option<Entity>>;

    async fn get_key(&self, id: &str) -> Result<Option<Key>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Records
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_message(&self, id: &TypedId) -> Result<Option<Message>>;

    async fn get_association(&self, id: &TypedId) -> Result<Option<Association>>;

    async fn find_association(&self, key: &AssociationKey) -> Result<Option<Association>>;

    /// Associations pointing at `target`, newest first.
    async fn associations_for_target(&self, target: &TypedId) -> Result<Vec<Association>>;

    async fn get_profile(&self, id: &TypedId) -> Result<Option<Profile>>;

    async fn get_timeline(&self, id: &TypedId) -> Result<Option<Timeline>>;

    async fn get_subscription(&self, id: &TypedId) -> Result<Option<Subscription>>;

    /// Id of the mutable record of `kind` keyed by `(semantic_id, owner)`.
    async fn find_semantic(
        &self,
        kind: ResourceKind,
        owner: &str,
        semantic_id: &str,
    ) -> Result<Option<TypedId>>;

    /// Whether a deletion has been recorded for `target`.
    async fn is_deleted(&self, target: &str) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions and Acks
    // ─────────────────────────────────────────────────────────────────────────

    async fn subscription_items(&self, subscription: &str) -> Result<Vec<SubscriptionItem>>;

    /// Remote domains holding subscription items on any of `timelines`.
    async fn subscriber_domains(&self, timelines: &[String]) -> Result<BTreeSet<String>>;

    async fn get_ack(&self, from: &str, to: &str) -> Result<Option<Ack>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Timeline Items
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_timeline_item(
        &self,
        timeline_id: &str,
        resource_id: &TypedId,
    ) -> Result<Option<TimelineItem>>;

    /// Items with `cdate < until`, newest first.
    async fn timeline_items_before(
        &self,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>>;

    /// Items with `cdate >= since`, oldest first.
    async fn timeline_items_since(
        &self,
        timelines: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>>;

    /// Every item of one timeline with `start <= cdate < end`, newest first.
    async fn timeline_items_between(
        &self,
        timeline_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineItem>>;
}

/// Sort key shared by every backend: `(cdate, resource id, timeline id)`.
pub fn item_order(item: &TimelineItem) -> (i64, String, String) {
    (
        item.cdate.timestamp_millis(),
        item.resource_id.to_string(),
        item.timeline_id.clone(),
    )
}
