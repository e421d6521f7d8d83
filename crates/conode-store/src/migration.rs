//! SQLite schema versions.
//!
//! `schema_migrations` records every version applied; opening a store runs
//! whatever is missing inside one transaction.

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub const CURRENT_VERSION: u32 = 1;

/// Bring `conn` up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in current + 1..=CURRENT_VERSION {
        match version {
            1 => create_v1(&tx)?,
            other => {
                return Err(StoreError::Migration(format!("no schema version {}", other)));
            }
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, Utc::now().timestamp_millis()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Commit log, derived records, items and lookup tables.
///
/// Times are Unix milliseconds. Typed ids are stored in their string form.
fn create_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Interned schema URLs
        CREATE TABLE schemas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE
        );

        -- The authoritative transcript
        CREATE TABLE commit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            signed_at INTEGER NOT NULL,
            owners BLOB NOT NULL,            -- CBOR array of CCIDs
            is_ephemeral INTEGER NOT NULL,
            result TEXT,                     -- JSON returned at commit time
            cdate INTEGER NOT NULL
        );

        CREATE TABLE commit_owner (
            commit_id INTEGER NOT NULL REFERENCES commit_log(id),
            owner TEXT NOT NULL,
            PRIMARY KEY (commit_id, owner)
        );

        CREATE TABLE entity (
            ccid TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            tag TEXT NOT NULL DEFAULT '',
            score INTEGER NOT NULL DEFAULT 0,
            affiliation_document TEXT NOT NULL,
            affiliation_signature TEXT NOT NULL,
            tombstone_document TEXT,
            tombstone_signature TEXT,
            alias TEXT,
            cdate INTEGER NOT NULL,
            mdate INTEGER NOT NULL
        );

        CREATE TABLE subkey (
            id TEXT PRIMARY KEY,
            root TEXT NOT NULL,
            parent TEXT NOT NULL,
            enact_document TEXT NOT NULL,
            enact_signature TEXT NOT NULL,
            revoke_document TEXT,
            revoke_signature TEXT,
            valid_since INTEGER NOT NULL,
            valid_until INTEGER NOT NULL,
            revoked_at INTEGER
        );

        CREATE TABLE message (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            policy TEXT,
            policy_params TEXT,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            timelines BLOB NOT NULL,         -- CBOR array of timeline ids
            cdate INTEGER NOT NULL
        );

        -- Only the forward edge (association -> target) is stored
        CREATE TABLE association (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            owner TEXT NOT NULL,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            target TEXT NOT NULL,
            variant TEXT NOT NULL,
            unique_key TEXT NOT NULL,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            timelines BLOB NOT NULL,
            cdate INTEGER NOT NULL,
            UNIQUE (author, target, schema_id, variant, unique_key)
        );

        CREATE TABLE profile (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            semantic_id TEXT,
            policy TEXT,
            policy_params TEXT,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            cdate INTEGER NOT NULL,
            mdate INTEGER NOT NULL
        );

        CREATE TABLE timeline (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            semantic_id TEXT,
            indexable INTEGER NOT NULL,
            domain_owned INTEGER NOT NULL,
            policy TEXT,
            policy_params TEXT,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            cdate INTEGER NOT NULL,
            mdate INTEGER NOT NULL
        );

        CREATE TABLE timeline_item (
            resource_id TEXT NOT NULL,
            timeline_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            author TEXT,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            cdate INTEGER NOT NULL,
            PRIMARY KEY (timeline_id, resource_id)
        );

        CREATE TABLE subscription (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            schema_id INTEGER NOT NULL REFERENCES schemas(id),
            semantic_id TEXT,
            indexable INTEGER NOT NULL,
            domain_owned INTEGER NOT NULL,
            policy TEXT,
            policy_params TEXT,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            cdate INTEGER NOT NULL,
            mdate INTEGER NOT NULL
        );

        CREATE TABLE subscription_item (
            id TEXT NOT NULL,                -- subscribed timeline
            subscription TEXT NOT NULL,
            resolver TEXT NOT NULL,          -- 'entity' or 'domain'
            entity TEXT,
            domain TEXT,
            subscriber_domain TEXT,
            PRIMARY KEY (id, subscription)
        );

        CREATE TABLE ack (
            from_ccid TEXT NOT NULL,
            to_ccid TEXT NOT NULL,
            document TEXT NOT NULL,
            signature TEXT NOT NULL,
            cdate INTEGER NOT NULL,
            PRIMARY KEY (from_ccid, to_ccid)
        );

        CREATE TABLE deletion (
            target TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            cdate INTEGER NOT NULL
        );

        -- Read paths
        CREATE INDEX idx_commit_owner_owner ON commit_owner(owner);
        CREATE INDEX idx_entity_domain ON entity(domain);
        CREATE INDEX idx_subkey_root ON subkey(root);
        CREATE INDEX idx_association_target ON association(target);
        CREATE UNIQUE INDEX idx_profile_semantic ON profile(author, semantic_id)
            WHERE semantic_id IS NOT NULL;
        CREATE UNIQUE INDEX idx_timeline_semantic ON timeline(author, semantic_id)
            WHERE semantic_id IS NOT NULL;
        CREATE UNIQUE INDEX idx_subscription_semantic ON subscription(author, semantic_id)
            WHERE semantic_id IS NOT NULL;
        CREATE INDEX idx_timeline_item_cdate ON timeline_item(timeline_id, cdate);
        CREATE INDEX idx_timeline_item_resource ON timeline_item(resource_id);
        CREATE INDEX idx_subscription_item_subscription ON subscription_item(subscription);
        "#,
    )?;

    Ok(())
}
