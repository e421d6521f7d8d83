//! Subkey enactment and revocation.

use conode_core::{is_ckid, EnactDocument, Key, RevokeDocument};
use conode_store::{Mutation, Store};

use super::{Env, Plan};
use crate::error::{NodeError, Result};

pub(super) async fn enact<S: Store>(env: &Env<'_, S>, doc: &EnactDocument) -> Result<Plan> {
    if !is_ckid(&doc.target) {
        return Err(NodeError::Malformed(format!("target: {} is not a subkey", doc.target)));
    }
    if doc.root != doc.base.signer {
        return Err(NodeError::PermissionDenied(format!(
            "{} cannot enact keys for {}",
            doc.base.signer, doc.root
        )));
    }
    // The declared parent must be the key that signed.
    if env.chain.signing_key() != doc.parent {
        return Err(NodeError::PermissionDenied(format!(
            "{} was not signed by its parent {}",
            doc.target, doc.parent
        )));
    }
    if env.store.get_key(&doc.target).await?.is_some() {
        return Err(NodeError::AlreadyExists(format!("key {}", doc.target)));
    }

    let (parent_since, parent_until) = env.chain.signing_validity();
    let key = Key {
        id: doc.target.clone(),
        root: doc.root.clone(),
        parent: doc.parent.clone(),
        enact_document: env.raw.to_string(),
        enact_signature: env.signature.to_string(),
        revoke_document: None,
        revoke_signature: None,
        valid_since: parent_since.max(doc.base.signed_at),
        valid_until: parent_until,
        revoked_at: None,
    };

    let mut plan = Plan::new(&key)?;
    plan.created = true;
    plan.owner(doc.root.clone());
    plan.mutations.push(Mutation::InsertKey(key));
    Ok(plan)
}

pub(super) async fn revoke<S: Store>(env: &Env<'_, S>, doc: &RevokeDocument) -> Result<Plan> {
    let mut key = env
        .store
        .get_key(&doc.target)
        .await?
        .ok_or_else(|| NodeError::NotFound(format!("key {}", doc.target)))?;

    if key.root != doc.base.signer {
        return Err(NodeError::PermissionDenied(format!(
            "{} cannot revoke keys of {}",
            doc.base.signer, key.root
        )));
    }
    let signing = env.chain.signing_key();
    if signing != key.id && signing != key.parent && signing != key.root {
        return Err(NodeError::PermissionDenied(format!(
            "{} may not revoke {}",
            signing, key.id
        )));
    }
    if key.revoked_at.is_some() {
        return Err(NodeError::AlreadyDeleted(format!("key {}", key.id)));
    }

    key.revoke_document = Some(env.raw.to_string());
    key.revoke_signature = Some(env.signature.to_string());
    key.revoked_at = Some(doc.base.signed_at);

    let mut plan = Plan::new(&key)?;
    plan.owner(key.root.clone());
    plan.mutations.push(Mutation::RevokeKey {
        id: key.id,
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        revoked_at: doc.base.signed_at,
    });
    Ok(plan)
}
