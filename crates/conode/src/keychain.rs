//! Delegated key chains.
//!
//! An entity signs either with its root key or with a subkey enacted under
//! it. A subkey may itself enact further subkeys, forming a chain from the
//! signing key back to the root. A document is valid only if every link of
//! that chain was active at the document's `signedAt`.

use chrono::{DateTime, TimeZone, Utc};
use conode_core::{verify_document, Document, Key};
use conode_store::Store;

use crate::error::{NodeError, Result};

/// Longest chain accepted between a signing subkey and its root.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Validity window of a root key.
pub fn root_validity() -> (DateTime<Utc>, DateTime<Utc>) {
    let since = DateTime::<Utc>::UNIX_EPOCH;
    let until = Utc
        .with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (since, until)
}

/// The links from a signing key to its root.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChain {
    /// The entity the chain belongs to.
    pub root: String,
    /// Subkeys, leaf first. Empty when the root signed directly.
    pub links: Vec<Key>,
}

impl KeyChain {
    pub fn root_only(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            links: Vec::new(),
        }
    }

    pub fn is_root_only(&self) -> bool {
        self.links.is_empty()
    }

    /// The key that produced the signature.
    pub fn signing_key(&self) -> &str {
        self.links.first().map_or(self.root.as_str(), |k| k.id.as_str())
    }

    /// Validity of the signing key, as inherited by keys it enacts.
    pub fn signing_validity(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        match self.links.first() {
            Some(key) => (key.valid_since, key.valid_until),
            None => root_validity(),
        }
    }

    /// Every link active at `t`.
    pub fn check_active_at(&self, t: DateTime<Utc>) -> Result<()> {
        for key in &self.links {
            if !key.is_active_at(t) {
                return Err(NodeError::PermissionDenied(format!(
                    "key {} is not active at {}",
                    key.id,
                    t.to_rfc3339()
                )));
            }
        }
        Ok(())
    }
}

/// Walk from `key_id` up to its root.
pub async fn resolve_chain<S: Store + ?Sized>(store: &S, key_id: &str) -> Result<KeyChain> {
    let mut links: Vec<Key> = Vec::new();
    let mut next = key_id.to_string();

    loop {
        if links.len() == MAX_CHAIN_DEPTH {
            return Err(NodeError::PermissionDenied(format!(
                "key chain of {} exceeds {} links",
                key_id, MAX_CHAIN_DEPTH
            )));
        }
        if links.iter().any(|k| k.id == next) {
            return Err(NodeError::PermissionDenied(format!("key chain of {} loops", key_id)));
        }

        let key = store
            .get_key(&next)
            .await?
            .ok_or_else(|| NodeError::NotFound(format!("key {}", next)))?;

        if let Some(child) = links.last() {
            if child.root != key.root {
                return Err(NodeError::PermissionDenied(format!(
                    "key {} and its parent {} have different roots",
                    child.id, key.id
                )));
            }
        }

        let parent = key.parent.clone();
        let root = key.root.clone();
        links.push(key);
        if parent == root {
            return Ok(KeyChain { root, links });
        }
        next = parent;
    }
}

/// Verify who signed `raw` and that they were allowed to at `signedAt`.
///
/// Without a `keyID` the signature must recover to the signer itself.
pub async fn authenticate<S: Store + ?Sized>(
    store: &S,
    raw: &str,
    signature: &str,
    doc: &Document,
) -> Result<KeyChain> {
    let signer = doc.signer();
    let key_id = doc.key_id().filter(|k| !k.is_empty());

    let Some(key_id) = key_id else {
        verify_document(raw, signature, signer)?;
        return Ok(KeyChain::root_only(signer));
    };

    verify_document(raw, signature, key_id)?;

    let chain = resolve_chain(store, key_id).await?;
    if chain.root != signer {
        return Err(NodeError::PermissionDenied(format!(
            "key {} does not belong to {}",
            key_id, signer
        )));
    }
    chain.check_active_at(doc.signed_at())?;
    Ok(chain)
}
