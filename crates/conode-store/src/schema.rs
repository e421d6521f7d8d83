//! Schema URL interning.
//!
//! Schema URLs are stored as small integers. The `schemas` table is the
//! source of truth; this cache only spares the lookup on the hot path.

use std::collections::HashMap;

use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Read-mostly `url -> id` cache.
#[derive(Debug, Default)]
pub struct SchemaCache {
    ids: RwLock<HashMap<String, i64>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<i64> {
        self.ids.read().get(url).copied()
    }

    /// Publish ids learned by a committed transaction.
    pub fn extend(&self, learned: impl IntoIterator<Item = (String, i64)>) {
        let mut ids = self.ids.write();
        for (url, id) in learned {
            ids.insert(url, id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interns schemas for one transaction.
///
/// Ids created inside the transaction are held back until it commits, so a
/// rollback never leaves a dangling id in the cache.
pub struct Interner<'a> {
    cache: &'a SchemaCache,
    learned: Vec<(String, i64)>,
}

impl<'a> Interner<'a> {
    pub fn new(cache: &'a SchemaCache) -> Self {
        Self {
            cache,
            learned: Vec::new(),
        }
    }

    pub fn intern(&mut self, conn: &Connection, url: &str) -> Result<i64> {
        if let Some(id) = self.cache.get(url) {
            return Ok(id);
        }
        if let Some((_, id)) = self.learned.iter().find(|(u, _)| u == url) {
            return Ok(*id);
        }

        let existing: Option<i64> = conn
            .query_row("SELECT id FROM schemas WHERE url = ?1", params![url], |row| {
                row.get(0)
            })
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                conn.execute("INSERT INTO schemas (url) VALUES (?1)", params![url])?;
                conn.last_insert_rowid()
            }
        };
        self.learned.push((url.to_string(), id));
        Ok(id)
    }

    /// Publish learned ids; call only after the transaction committed.
    pub fn publish(self) {
        self.cache.extend(self.learned);
    }
}
