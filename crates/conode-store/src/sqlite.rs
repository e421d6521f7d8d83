//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via `tokio::task::spawn_blocking`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use conode_core::{
    Ack, Association, AssociationKey, Cdid, CommitLog, DocumentKind, Entity, Key, Message,
    Profile, ResolverType, ResourceKind, Subscription, SubscriptionItem, Timeline, TimelineItem,
    TypedId,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::schema::{Interner, SchemaCache};
use crate::traits::{ApplyResult, CommitBatch, Mutation, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    schemas: Arc<SchemaCache>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            schemas: Arc::new(SchemaCache::new()),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &SchemaCache) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let schemas = self.schemas.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn, &schemas)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn conversion(ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, ty, msg.into())
}

fn out_of_range(name: &str, ms: i64) -> rusqlite::Error {
    conversion(Type::Integer, format!("{}: timestamp {} out of range", name, ms))
}

fn col_time(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(name)?;
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| out_of_range(name, ms))
}

fn col_opt_time(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(name)?;
    ms.map(|ms| DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| out_of_range(name, ms)))
        .transpose()
}

fn col_typed(row: &Row<'_>, name: &str) -> rusqlite::Result<TypedId> {
    let s: String = row.get(name)?;
    TypedId::parse(&s).map_err(|e| conversion(Type::Text, format!("{}: {}", name, e)))
}

fn col_cbor<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> rusqlite::Result<T> {
    let bytes: Vec<u8> = row.get(name)?;
    ciborium::from_reader(bytes.as_slice())
        .map_err(|e| conversion(Type::Blob, format!("{}: {}", name, e)))
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mappers
// ─────────────────────────────────────────────────────────────────────────────

const COMMIT_COLUMNS: &str =
    "id, document_id, kind, document, signature, signed_at, owners, is_ephemeral, result, cdate";

fn row_to_commit(row: &Row<'_>) -> rusqlite::Result<CommitLog> {
    let document_id: String = row.get("document_id")?;
    let kind: String = row.get("kind")?;
    Ok(CommitLog {
        id: row.get("id")?,
        document_id: Cdid::parse(&document_id)
            .map_err(|e| conversion(Type::Text, format!("document_id: {}", e)))?,
        kind: DocumentKind::from_name(&kind)
            .ok_or_else(|| conversion(Type::Text, format!("kind: unknown `{}`", kind)))?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        signed_at: col_time(row, "signed_at")?,
        owners: col_cbor(row, "owners")?,
        is_ephemeral: row.get("is_ephemeral")?,
        result: row.get("result")?,
        cdate: col_time(row, "cdate")?,
    })
}

const ENTITY_COLUMNS: &str = "ccid, domain, tag, score, affiliation_document, \
     affiliation_signature, tombstone_document, tombstone_signature, alias, cdate, mdate";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        ccid: row.get("ccid")?,
        domain: row.get("domain")?,
        tag: row.get("tag")?,
        score: row.get("score")?,
        affiliation_document: row.get("affiliation_document")?,
        affiliation_signature: row.get("affiliation_signature")?,
        tombstone_document: row.get("tombstone_document")?,
        tombstone_signature: row.get("tombstone_signature")?,
        alias: row.get("alias")?,
        cdate: col_time(row, "cdate")?,
        mdate: col_time(row, "mdate")?,
    })
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<Key> {
    Ok(Key {
        id: row.get("id")?,
        root: row.get("root")?,
        parent: row.get("parent")?,
        enact_document: row.get("enact_document")?,
        enact_signature: row.get("enact_signature")?,
        revoke_document: row.get("revoke_document")?,
        revoke_signature: row.get("revoke_signature")?,
        valid_since: col_time(row, "valid_since")?,
        valid_until: col_time(row, "valid_until")?,
        revoked_at: col_opt_time(row, "revoked_at")?,
    })
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.author, s.url AS schema, m.policy, m.policy_params, \
     m.document, m.signature, m.timelines, m.cdate \
     FROM message m JOIN schemas s ON s.id = m.schema_id";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: col_typed(row, "id")?,
        author: row.get("author")?,
        schema: row.get("schema")?,
        policy: row.get("policy")?,
        policy_params: row.get("policy_params")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        timelines: col_cbor(row, "timelines")?,
        cdate: col_time(row, "cdate")?,
    })
}

const ASSOCIATION_SELECT: &str = "SELECT a.id, a.author, a.owner, s.url AS schema, a.target, \
     a.variant, a.unique_key, a.document, a.signature, a.timelines, a.cdate \
     FROM association a JOIN schemas s ON s.id = a.schema_id";

fn row_to_association(row: &Row<'_>) -> rusqlite::Result<Association> {
    Ok(Association {
        id: col_typed(row, "id")?,
        author: row.get("author")?,
        owner: row.get("owner")?,
        schema: row.get("schema")?,
        target: col_typed(row, "target")?,
        variant: row.get("variant")?,
        unique: row.get("unique_key")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        timelines: col_cbor(row, "timelines")?,
        cdate: col_time(row, "cdate")?,
    })
}

const PROFILE_SELECT: &str = "SELECT p.id, p.author, s.url AS schema, p.semantic_id, p.policy, \
     p.policy_params, p.document, p.signature, p.cdate, p.mdate \
     FROM profile p JOIN schemas s ON s.id = p.schema_id";

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: col_typed(row, "id")?,
        author: row.get("author")?,
        schema: row.get("schema")?,
        semantic_id: row.get("semantic_id")?,
        policy: row.get("policy")?,
        policy_params: row.get("policy_params")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        cdate: col_time(row, "cdate")?,
        mdate: col_time(row, "mdate")?,
    })
}

fn container_select(table: &str) -> String {
    format!(
        "SELECT c.id, c.author, s.url AS schema, c.semantic_id, c.indexable, c.domain_owned, \
         c.policy, c.policy_params, c.document, c.signature, c.cdate, c.mdate \
         FROM {} c JOIN schemas s ON s.id = c.schema_id",
        table
    )
}

fn row_to_timeline(row: &Row<'_>) -> rusqlite::Result<Timeline> {
    Ok(Timeline {
        id: col_typed(row, "id")?,
        author: row.get("author")?,
        schema: row.get("schema")?,
        semantic_id: row.get("semantic_id")?,
        indexable: row.get("indexable")?,
        domain_owned: row.get("domain_owned")?,
        policy: row.get("policy")?,
        policy_params: row.get("policy_params")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        cdate: col_time(row, "cdate")?,
        mdate: col_time(row, "mdate")?,
    })
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: col_typed(row, "id")?,
        author: row.get("author")?,
        schema: row.get("schema")?,
        semantic_id: row.get("semantic_id")?,
        indexable: row.get("indexable")?,
        domain_owned: row.get("domain_owned")?,
        policy: row.get("policy")?,
        policy_params: row.get("policy_params")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        cdate: col_time(row, "cdate")?,
        mdate: col_time(row, "mdate")?,
    })
}

const ITEM_SELECT: &str = "SELECT i.resource_id, i.timeline_id, i.owner, i.author, \
     s.url AS schema, i.cdate FROM timeline_item i JOIN schemas s ON s.id = i.schema_id";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<TimelineItem> {
    Ok(TimelineItem {
        resource_id: col_typed(row, "resource_id")?,
        timeline_id: row.get("timeline_id")?,
        owner: row.get("owner")?,
        author: row.get("author")?,
        schema: row.get("schema")?,
        cdate: col_time(row, "cdate")?,
    })
}

fn row_to_subscription_item(row: &Row<'_>) -> rusqlite::Result<SubscriptionItem> {
    let resolver: String = row.get("resolver")?;
    Ok(SubscriptionItem {
        id: row.get("id")?,
        subscription: row.get("subscription")?,
        resolver: ResolverType::from_name(&resolver)
            .ok_or_else(|| conversion(Type::Text, format!("resolver: unknown `{}`", resolver)))?,
        entity: row.get("entity")?,
        domain: row.get("domain")?,
        subscriber_domain: row.get("subscriber_domain")?,
    })
}

fn row_to_ack(row: &Row<'_>) -> rusqlite::Result<Ack> {
    Ok(Ack {
        from: row.get("from_ccid")?,
        to: row.get("to_ccid")?,
        document: row.get("document")?,
        signature: row.get("signature")?,
        cdate: col_time(row, "cdate")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Commit transaction
// ─────────────────────────────────────────────────────────────────────────────

fn select_commit(conn: &Connection, document_id: &Cdid) -> Result<Option<CommitLog>> {
    conn.query_row(
        &format!("SELECT {} FROM commit_log WHERE document_id = ?1", COMMIT_COLUMNS),
        params![document_id.to_string()],
        row_to_commit,
    )
    .optional()
    .map_err(StoreError::from)
}

fn apply_commit_tx(
    conn: &mut Connection,
    schemas: &SchemaCache,
    batch: CommitBatch,
) -> Result<ApplyResult> {
    let CommitBatch {
        log,
        mutations,
        deadline,
    } = batch;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut interner = Interner::new(schemas);

    let Some(mut log) = log else {
        for mutation in &mutations {
            apply_mutation(&tx, &mut interner, mutation)?;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::DeadlineExceeded);
        }
        tx.commit()?;
        interner.publish();
        return Ok(ApplyResult::Unlogged);
    };

    if let Some(existing) = select_commit(&tx, &log.document_id)? {
        return Ok(if existing.document == log.document {
            ApplyResult::Duplicate(existing)
        } else {
            ApplyResult::Conflict(existing)
        });
    }

    tx.execute(
        "INSERT INTO commit_log (document_id, kind, document, signature, signed_at, owners,
                                 is_ephemeral, result, cdate)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            log.document_id.to_string(),
            log.kind.as_str(),
            log.document,
            log.signature,
            millis(log.signed_at),
            encode_cbor(&log.owners)?,
            log.is_ephemeral,
            log.result,
            millis(log.cdate),
        ],
    )?;
    log.id = tx.last_insert_rowid();

    for owner in &log.owners {
        tx.execute(
            "INSERT OR IGNORE INTO commit_owner (commit_id, owner) VALUES (?1, ?2)",
            params![log.id, owner],
        )?;
    }

    for mutation in &mutations {
        apply_mutation(&tx, &mut interner, mutation)?;
    }

    if deadline.is_some_and(|d| Instant::now() >= d) {
        // Dropping the transaction rolls it back.
        return Err(StoreError::DeadlineExceeded);
    }

    tx.commit()?;
    interner.publish();

    debug!(document_id = %log.document_id, kind = %log.kind, "commit applied");
    Ok(ApplyResult::Applied(log))
}

fn apply_mutation(
    tx: &Transaction<'_>,
    interner: &mut Interner<'_>,
    mutation: &Mutation,
) -> Result<()> {
    match mutation {
        Mutation::UpsertEntity(e) => {
            tx.execute(
                "INSERT INTO entity (ccid, domain, tag, score, affiliation_document,
                                     affiliation_signature, tombstone_document, tombstone_signature,
                                     alias, cdate, mdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(ccid) DO UPDATE SET
                    domain = excluded.domain,
                    affiliation_document = excluded.affiliation_document,
                    affiliation_signature = excluded.affiliation_signature,
                    mdate = excluded.mdate",
                params![
                    e.ccid,
                    e.domain,
                    e.tag,
                    e.score,
                    e.affiliation_document,
                    e.affiliation_signature,
                    e.tombstone_document,
                    e.tombstone_signature,
                    e.alias,
                    millis(e.cdate),
                    millis(e.mdate),
                ],
            )?;
        }
        Mutation::TombstoneEntity {
            ccid,
            document,
            signature,
            at,
        } => {
            tx.execute(
                "UPDATE entity SET tombstone_document = ?2, tombstone_signature = ?3, mdate = ?4
                 WHERE ccid = ?1",
                params![ccid, document, signature, millis(*at)],
            )?;
        }
        Mutation::InsertKey(k) => {
            tx.execute(
                "INSERT INTO subkey (id, root, parent, enact_document, enact_signature,
                                     revoke_document, revoke_signature, valid_since, valid_until,
                                     revoked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    k.id,
                    k.root,
                    k.parent,
                    k.enact_document,
                    k.enact_signature,
                    k.revoke_document,
                    k.revoke_signature,
                    millis(k.valid_since),
                    millis(k.valid_until),
                    k.revoked_at.map(millis),
                ],
            )?;
        }
        Mutation::RevokeKey {
            id,
            document,
            signature,
            revoked_at,
        } => {
            tx.execute(
                "UPDATE subkey SET revoke_document = ?2, revoke_signature = ?3, revoked_at = ?4
                 WHERE id = ?1",
                params![id, document, signature, millis(*revoked_at)],
            )?;
        }
        Mutation::InsertMessage(m) => {
            let schema_id = interner.intern(tx, &m.schema)?;
            tx.execute(
                "INSERT INTO message (id, author, schema_id, policy, policy_params, document,
                                      signature, timelines, cdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    m.id.to_string(),
                    m.author,
                    schema_id,
                    m.policy,
                    m.policy_params,
                    m.document,
                    m.signature,
                    encode_cbor(&m.timelines)?,
                    millis(m.cdate),
                ],
            )?;
        }
        Mutation::DeleteMessage(id) => {
            tx.execute("DELETE FROM message WHERE id = ?1", params![id.to_string()])?;
        }
        Mutation::InsertAssociation(a) => {
            let schema_id = interner.intern(tx, &a.schema)?;
            tx.execute(
                "INSERT OR IGNORE INTO association
                     (id, author, owner, schema_id, target, variant,
                      unique_key, document, signature, timelines, cdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    a.id.to_string(),
                    a.author,
                    a.owner,
                    schema_id,
                    a.target.to_string(),
                    a.variant,
                    a.unique,
                    a.document,
                    a.signature,
                    encode_cbor(&a.timelines)?,
                    millis(a.cdate),
                ],
            )?;
        }
        Mutation::DeleteAssociation(id) => {
            tx.execute("DELETE FROM association WHERE id = ?1", params![id.to_string()])?;
        }
        Mutation::UpsertProfile(p) => {
            let schema_id = interner.intern(tx, &p.schema)?;
            tx.execute(
                "INSERT INTO profile (id, author, schema_id, semantic_id, policy, policy_params,
                                      document, signature, cdate, mdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    schema_id = excluded.schema_id,
                    semantic_id = excluded.semantic_id,
                    policy = excluded.policy,
                    policy_params = excluded.policy_params,
                    document = excluded.document,
                    signature = excluded.signature,
                    mdate = excluded.mdate",
                params![
                    p.id.to_string(),
                    p.author,
                    schema_id,
                    p.semantic_id,
                    p.policy,
                    p.policy_params,
                    p.document,
                    p.signature,
                    millis(p.cdate),
                    millis(p.mdate),
                ],
            )?;
        }
        Mutation::DeleteProfile(id) => {
            tx.execute("DELETE FROM profile WHERE id = ?1", params![id.to_string()])?;
        }
        Mutation::UpsertTimeline(t) => {
            let schema_id = interner.intern(tx, &t.schema)?;
            upsert_container(
                tx,
                "timeline",
                &t.id,
                &t.author,
                schema_id,
                t.semantic_id.as_deref(),
                t.indexable,
                t.domain_owned,
                t.policy.as_deref(),
                t.policy_params.as_deref(),
                &t.document,
                &t.signature,
                t.cdate,
                t.mdate,
            )?;
        }
        Mutation::DeleteTimeline(id) => {
            tx.execute("DELETE FROM timeline WHERE id = ?1", params![id.to_string()])?;
            tx.execute(
                "DELETE FROM timeline_item WHERE timeline_id = ?1",
                params![id.to_string()],
            )?;
        }
        Mutation::UpsertSubscription(s) => {
            let schema_id = interner.intern(tx, &s.schema)?;
            upsert_container(
                tx,
                "subscription",
                &s.id,
                &s.author,
                schema_id,
                s.semantic_id.as_deref(),
                s.indexable,
                s.domain_owned,
                s.policy.as_deref(),
                s.policy_params.as_deref(),
                &s.document,
                &s.signature,
                s.cdate,
                s.mdate,
            )?;
        }
        Mutation::DeleteSubscription(id) => {
            tx.execute("DELETE FROM subscription WHERE id = ?1", params![id.to_string()])?;
            tx.execute(
                "DELETE FROM subscription_item WHERE subscription = ?1",
                params![id.to_string()],
            )?;
        }
        Mutation::InsertSubscriptionItem(item) => {
            tx.execute(
                "INSERT INTO subscription_item (id, subscription, resolver, entity, domain,
                                                subscriber_domain)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id, subscription) DO UPDATE SET
                    resolver = excluded.resolver,
                    entity = excluded.entity,
                    domain = excluded.domain,
                    subscriber_domain = excluded.subscriber_domain",
                params![
                    item.id,
                    item.subscription,
                    item.resolver.as_str(),
                    item.entity,
                    item.domain,
                    item.subscriber_domain,
                ],
            )?;
        }
        Mutation::DeleteSubscriptionItem { subscription, id } => {
            tx.execute(
                "DELETE FROM subscription_item WHERE subscription = ?1 AND id = ?2",
                params![subscription, id],
            )?;
        }
        Mutation::InsertTimelineItem(item) => {
            let schema_id = interner.intern(tx, &item.schema)?;
            tx.execute(
                "INSERT OR IGNORE INTO timeline_item (resource_id, timeline_id, owner, author,
                                                      schema_id, cdate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    item.resource_id.to_string(),
                    item.timeline_id,
                    item.owner,
                    item.author,
                    schema_id,
                    millis(item.cdate),
                ],
            )?;
        }
        Mutation::DeleteTimelineItem {
            timeline_id,
            resource_id,
        } => {
            tx.execute(
                "DELETE FROM timeline_item WHERE timeline_id = ?1 AND resource_id = ?2",
                params![timeline_id, resource_id.to_string()],
            )?;
        }
        Mutation::DeleteTimelineItemsForResource(resource_id) => {
            tx.execute(
                "DELETE FROM timeline_item WHERE resource_id = ?1",
                params![resource_id.to_string()],
            )?;
        }
        Mutation::UpsertAck(ack) => {
            tx.execute(
                "INSERT INTO ack (from_ccid, to_ccid, document, signature, cdate)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(from_ccid, to_ccid) DO UPDATE SET
                    document = excluded.document,
                    signature = excluded.signature,
                    cdate = excluded.cdate",
                params![ack.from, ack.to, ack.document, ack.signature, millis(ack.cdate)],
            )?;
        }
        Mutation::DeleteAck { from, to } => {
            tx.execute(
                "DELETE FROM ack WHERE from_ccid = ?1 AND to_ccid = ?2",
                params![from, to],
            )?;
        }
        Mutation::RecordDeletion {
            target,
            document_id,
            at,
        } => {
            tx.execute(
                "INSERT OR IGNORE INTO deletion (target, document_id, cdate) VALUES (?1, ?2, ?3)",
                params![target, document_id.to_string(), millis(*at)],
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn upsert_container(
    tx: &Transaction<'_>,
    table: &str,
    id: &TypedId,
    author: &str,
    schema_id: i64,
    semantic_id: Option<&str>,
    indexable: bool,
    domain_owned: bool,
    policy: Option<&str>,
    policy_params: Option<&str>,
    document: &str,
    signature: &str,
    cdate: DateTime<Utc>,
    mdate: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO {} (id, author, schema_id, semantic_id, indexable, domain_owned, policy,
                             policy_params, document, signature, cdate, mdate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                schema_id = excluded.schema_id,
                semantic_id = excluded.semantic_id,
                indexable = excluded.indexable,
                domain_owned = excluded.domain_owned,
                policy = excluded.policy,
                policy_params = excluded.policy_params,
                document = excluded.document,
                signature = excluded.signature,
                mdate = excluded.mdate",
            table
        ),
        params![
            id.to_string(),
            author,
            schema_id,
            semantic_id,
            indexable,
            domain_owned,
            policy,
            policy_params,
            document,
            signature,
            millis(cdate),
            millis(mdate),
        ],
    )?;
    Ok(())
}

fn query_items(
    conn: &Connection,
    filter: &str,
    order: &str,
    timelines: &[String],
    bound: i64,
    limit: Option<usize>,
) -> Result<Vec<TimelineItem>> {
    if timelines.is_empty() {
        return Ok(Vec::new());
    }
    let mut sql = format!(
        "{} WHERE i.timeline_id IN ({}) AND {} ORDER BY {}",
        ITEM_SELECT,
        placeholders(timelines.len()),
        filter,
        order
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut values: Vec<rusqlite::types::Value> = timelines
        .iter()
        .map(|t| rusqlite::types::Value::Text(t.clone()))
        .collect();
    values.push(rusqlite::types::Value::Integer(bound));

    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(values), row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

#[async_trait]
impl Store for SqliteStore {
    async fn apply_commit(&self, batch: CommitBatch) -> Result<ApplyResult> {
        self.run(move |conn, schemas| apply_commit_tx(conn, schemas, batch))
            .await
    }

    async fn get_commit(&self, document_id: &Cdid) -> Result<Option<CommitLog>> {
        let document_id = *document_id;
        self.run(move |conn, _| select_commit(conn, &document_id)).await
    }

    async fn commits_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<CommitLog>> {
        let owner = owner.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commit_log WHERE id IN
                    (SELECT commit_id FROM commit_owner WHERE owner = ?1)
                 ORDER BY id DESC LIMIT ?2",
                COMMIT_COLUMNS
            ))?;
            let logs = stmt
                .query_map(params![owner, limit as i64], row_to_commit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
        .await
    }

    async fn get_entity(&self, ccid: &str) -> Result<Option<Entity>> {
        let ccid = ccid.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("SELECT {} FROM entity WHERE ccid = ?1", ENTITY_COLUMNS),
                params![ccid],
                row_to_entity,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_key(&self, id: &str) -> Result<Option<Key>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row("SELECT * FROM subkey WHERE id = ?1", params![id], row_to_key)
                .optional()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_message(&self, id: &TypedId) -> Result<Option<Message>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE m.id = ?1", MESSAGE_SELECT),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_association(&self, id: &TypedId) -> Result<Option<Association>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE a.id = ?1", ASSOCIATION_SELECT),
                params![id],
                row_to_association,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn find_association(&self, key: &AssociationKey) -> Result<Option<Association>> {
        let key = key.clone();
        self.run(move |conn, _| {
            conn.query_row(
                &format!(
                    "{} WHERE a.author = ?1 AND a.target = ?2 AND s.url = ?3
                       AND a.variant = ?4 AND a.unique_key = ?5",
                    ASSOCIATION_SELECT
                ),
                params![key.author, key.target.to_string(), key.schema, key.variant, key.unique],
                row_to_association,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn associations_for_target(&self, target: &TypedId) -> Result<Vec<Association>> {
        let target = target.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE a.target = ?1 ORDER BY a.cdate DESC, a.id DESC",
                ASSOCIATION_SELECT
            ))?;
            let rows = stmt
                .query_map(params![target], row_to_association)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_profile(&self, id: &TypedId) -> Result<Option<Profile>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE p.id = ?1", PROFILE_SELECT),
                params![id],
                row_to_profile,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_timeline(&self, id: &TypedId) -> Result<Option<Timeline>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE c.id = ?1", container_select("timeline")),
                params![id],
                row_to_timeline,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_subscription(&self, id: &TypedId) -> Result<Option<Subscription>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE c.id = ?1", container_select("subscription")),
                params![id],
                row_to_subscription,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn find_semantic(
        &self,
        kind: ResourceKind,
        owner: &str,
        semantic_id: &str,
    ) -> Result<Option<TypedId>> {
        let table = match kind {
            ResourceKind::Profile => "profile",
            ResourceKind::Timeline => "timeline",
            ResourceKind::Subscription => "subscription",
            ResourceKind::Message | ResourceKind::Association => return Ok(None),
        };
        let owner = owner.to_string();
        let semantic_id = semantic_id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("SELECT id FROM {} WHERE author = ?1 AND semantic_id = ?2", table),
                params![owner, semantic_id],
                |row| col_typed(row, "id"),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn is_deleted(&self, target: &str) -> Result<bool> {
        let target = target.to_string();
        self.run(move |conn, _| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM deletion WHERE target = ?1)",
                params![target],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn subscription_items(&self, subscription: &str) -> Result<Vec<SubscriptionItem>> {
        let subscription = subscription.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT * FROM subscription_item WHERE subscription = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![subscription], row_to_subscription_item)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn subscriber_domains(&self, timelines: &[String]) -> Result<BTreeSet<String>> {
        if timelines.is_empty() {
            return Ok(BTreeSet::new());
        }
        let timelines = timelines.to_vec();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT subscriber_domain FROM subscription_item
                 WHERE subscriber_domain IS NOT NULL AND id IN ({})",
                placeholders(timelines.len())
            ))?;
            let domains = stmt
                .query_map(params_from_iter(timelines.iter()), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(domains)
        })
        .await
    }

    async fn get_ack(&self, from: &str, to: &str) -> Result<Option<Ack>> {
        let from = from.to_string();
        let to = to.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                "SELECT * FROM ack WHERE from_ccid = ?1 AND to_ccid = ?2",
                params![from, to],
                row_to_ack,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_timeline_item(
        &self,
        timeline_id: &str,
        resource_id: &TypedId,
    ) -> Result<Option<TimelineItem>> {
        let timeline_id = timeline_id.to_string();
        let resource_id = resource_id.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                &format!("{} WHERE i.timeline_id = ?1 AND i.resource_id = ?2", ITEM_SELECT),
                params![timeline_id, resource_id],
                row_to_item,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn timeline_items_before(
        &self,
        timelines: &[String],
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let timelines = timelines.to_vec();
        self.run(move |conn, _| {
            query_items(
                conn,
                "i.cdate < ?",
                "i.cdate DESC, i.resource_id DESC, i.timeline_id DESC",
                &timelines,
                millis(until),
                Some(limit),
            )
        })
        .await
    }

    async fn timeline_items_since(
        &self,
        timelines: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimelineItem>> {
        let timelines = timelines.to_vec();
        self.run(move |conn, _| {
            query_items(
                conn,
                "i.cdate >= ?",
                "i.cdate ASC, i.resource_id ASC, i.timeline_id ASC",
                &timelines,
                millis(since),
                Some(limit),
            )
        })
        .await
    }

    async fn timeline_items_between(
        &self,
        timeline_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineItem>> {
        let timeline_id = timeline_id.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE i.timeline_id = ?1 AND i.cdate >= ?2 AND i.cdate < ?3
                 ORDER BY i.cdate DESC, i.resource_id DESC",
                ITEM_SELECT
            ))?;
            let items = stmt
                .query_map(params![timeline_id, millis(start), millis(end)], row_to_item)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn commit(document: &str, at: DateTime<Utc>) -> CommitLog {
        CommitLog {
            id: 0,
            document_id: Cdid::from_content(document.as_bytes(), at),
            kind: DocumentKind::Message,
            document: document.to_string(),
            signature: "00".into(),
            signed_at: at,
            owners: vec!["con1author".into()],
            is_ephemeral: false,
            result: Some("{}".into()),
            cdate: at,
        }
    }

    fn message(at: DateTime<Utc>) -> Message {
        Message {
            id: TypedId::new(ResourceKind::Message, Cdid::make_at(at)),
            author: "con1author".into(),
            schema: "https://schema.example/note".into(),
            policy: None,
            policy_params: None,
            document: "{}".into(),
            signature: "00".into(),
            timelines: vec!["t0".into()],
            cdate: at,
        }
    }

    fn item(timeline: &str, message: &Message) -> TimelineItem {
        TimelineItem {
            resource_id: message.id,
            timeline_id: timeline.to_string(),
            owner: message.author.clone(),
            author: Some(message.author.clone()),
            schema: message.schema.clone(),
            cdate: message.cdate,
        }
    }

    fn batch(log: CommitLog, mutations: Vec<Mutation>) -> CommitBatch {
        CommitBatch {
            log: Some(log),
            mutations,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_apply_and_replay() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let msg = message(now);
        let log = commit("{\"a\":1}", now);

        let first = store
            .apply_commit(batch(
                log.clone(),
                vec![
                    Mutation::InsertMessage(msg.clone()),
                    Mutation::InsertTimelineItem(item("t0", &msg)),
                ],
            ))
            .await
            .unwrap();
        let applied = match first {
            ApplyResult::Applied(l) => l,
            other => panic!("expected applied, got {:?}", other),
        };
        assert!(applied.id > 0);

        let second = store.apply_commit(batch(log.clone(), vec![])).await.unwrap();
        assert!(matches!(second, ApplyResult::Duplicate(ref l) if l.id == applied.id));

        let mut other = log.clone();
        other.document = "{\"a\":2}".into();
        let third = store.apply_commit(batch(other, vec![])).await.unwrap();
        assert!(matches!(third, ApplyResult::Conflict(_)));

        assert_eq!(store.get_message(&msg.id).await.unwrap(), Some(msg.clone()));
        let owned = store.commits_for_owner("con1author", 10).await.unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn test_unlogged_batch_skips_commit_log() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let msg = message(now);
        let result = store
            .apply_commit(CommitBatch {
                log: None,
                mutations: vec![Mutation::InsertTimelineItem(item("t0", &msg))],
                deadline: None,
            })
            .await
            .unwrap();
        assert_eq!(result, ApplyResult::Unlogged);
        assert!(store.commits_for_owner("con1author", 10).await.unwrap().is_empty());
        assert!(store
            .get_timeline_item("t0", &msg.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_deadline_rolls_back() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let msg = message(now);
        let log = commit("{\"late\":true}", now);
        let result = store
            .apply_commit(CommitBatch {
                log: Some(log.clone()),
                mutations: vec![Mutation::InsertMessage(msg.clone())],
                deadline: Some(Instant::now()),
            })
            .await;
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
        assert!(store.get_commit(&log.document_id).await.unwrap().is_none());
        assert!(store.get_message(&msg.id).await.unwrap().is_none());
        assert!(store.schemas.get(&msg.schema).is_none());
    }

    #[tokio::test]
    async fn test_association_uniqueness() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let target = TypedId::new(ResourceKind::Message, Cdid::make_at(now));
        let assoc = |n: i64| Association {
            id: TypedId::new(ResourceKind::Association, Cdid::make_at(now + Duration::seconds(n))),
            author: "con1author".into(),
            owner: "con1owner".into(),
            schema: "https://schema.example/like".into(),
            target,
            variant: "👍".into(),
            unique: "0123456789abcdef0123456789abcdef".into(),
            document: format!("{{\"n\":{}}}", n),
            signature: "00".into(),
            timelines: vec![],
            cdate: now,
        };

        for n in 0..3 {
            let a = assoc(n);
            store
                .apply_commit(batch(
                    commit(&a.document, now),
                    vec![Mutation::InsertAssociation(a)],
                ))
                .await
                .unwrap();
        }

        let rows = store.associations_for_target(&target).await.unwrap();
        assert_eq!(rows.len(), 1);
        let found = store.find_association(&assoc(0).key()).await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(rows[0].id));
    }

    #[tokio::test]
    async fn test_item_paging_is_ordered() {
        let store = SqliteStore::open_memory().unwrap();
        let base = Utc::now();
        let mut mutations = Vec::new();
        for n in 0..5 {
            let msg = message(base + Duration::seconds(n));
            mutations.push(Mutation::InsertTimelineItem(item("t0", &msg)));
            mutations.push(Mutation::InsertTimelineItem(item("t1", &msg)));
        }
        store
            .apply_commit(batch(commit("{\"bulk\":1}", base), mutations))
            .await
            .unwrap();

        let timelines = vec!["t0".to_string(), "t1".to_string()];
        let recent = store
            .timeline_items_before(&timelines, base + Duration::seconds(10), 4)
            .await
            .unwrap();
        assert_eq!(recent.len(), 4);
        assert!(recent.windows(2).all(|w| w[0].cdate >= w[1].cdate));

        let immediate = store
            .timeline_items_since(&timelines, base + Duration::seconds(3), 10)
            .await
            .unwrap();
        assert_eq!(immediate.len(), 4);
        assert!(immediate.windows(2).all(|w| w[0].cdate <= w[1].cdate));

        let window = store
            .timeline_items_between("t0", base, base + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_timeline_delete_cascades() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let timeline = Timeline {
            id: TypedId::new(ResourceKind::Timeline, Cdid::make_at(now)),
            author: "con1author".into(),
            schema: "https://schema.example/tl".into(),
            semantic_id: Some("home".into()),
            indexable: true,
            domain_owned: false,
            policy: None,
            policy_params: None,
            document: "{}".into(),
            signature: "00".into(),
            cdate: now,
            mdate: now,
        };
        let msg = message(now);
        let tl = timeline.id.to_string();
        store
            .apply_commit(batch(
                commit("{\"tl\":1}", now),
                vec![
                    Mutation::UpsertTimeline(timeline.clone()),
                    Mutation::InsertTimelineItem(item(&tl, &msg)),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(
            store
                .find_semantic(ResourceKind::Timeline, "con1author", "home")
                .await
                .unwrap(),
            Some(timeline.id)
        );

        store
            .apply_commit(batch(
                commit("{\"tl\":2}", now),
                vec![
                    Mutation::DeleteTimeline(timeline.id),
                    Mutation::RecordDeletion {
                        target: tl.clone(),
                        document_id: Cdid::make(),
                        at: now,
                    },
                ],
            ))
            .await
            .unwrap();
        assert!(store.get_timeline(&timeline.id).await.unwrap().is_none());
        assert!(store.get_timeline_item(&tl, &msg.id).await.unwrap().is_none());
        assert!(store.is_deleted(&tl).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscriber_domains() {
        let store = SqliteStore::open_memory().unwrap();
        let item = |sub: &str, domain: Option<&str>| SubscriptionItem {
            id: "t0@a.example".into(),
            subscription: sub.into(),
            resolver: ResolverType::Entity,
            entity: Some("con1author".into()),
            domain: None,
            subscriber_domain: domain.map(String::from),
        };
        store
            .apply_commit(batch(
                commit("{\"sub\":1}", Utc::now()),
                vec![
                    Mutation::InsertSubscriptionItem(item("s1", Some("b.example"))),
                    Mutation::InsertSubscriptionItem(item("s2", Some("c.example"))),
                    Mutation::InsertSubscriptionItem(item("s3", None)),
                ],
            ))
            .await
            .unwrap();

        let domains = store
            .subscriber_domains(&["t0@a.example".to_string()])
            .await
            .unwrap();
        assert_eq!(
            domains.into_iter().collect::<Vec<_>>(),
            vec!["b.example".to_string(), "c.example".to_string()]
        );
        assert_eq!(store.subscription_items("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_on_disk_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conode.db");
        let now = Utc::now();
        let log = commit("{\"disk\":1}", now);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.apply_commit(batch(log.clone(), vec![])).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let found = store.get_commit(&log.document_id).await.unwrap().unwrap();
        assert_eq!(found.document, log.document);
        assert_eq!(found.owners, log.owners);
    }
}
