//! Affiliation and tombstone: an entity's lifecycle.

use conode_core::{AffiliationDocument, Entity, TombstoneDocument};
use conode_policy::{Action, PolicyTarget};
use conode_store::{Mutation, Store};
use tracing::debug;

use super::{Env, Plan};
use crate::access::ensure_allowed;
use crate::error::{NodeError, Result};

pub(super) async fn affiliate<S: Store>(
    env: &Env<'_, S>,
    doc: &AffiliationDocument,
) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let existing = env.store.get_entity(signer).await?;

    if let Some(entity) = &existing {
        if entity.mdate > doc.base.signed_at {
            debug!(ccid = %signer, "newer affiliation exists");
            return Plan::unchanged(entity);
        }
    }

    let joins_here = env.is_local_domain(&doc.domain)
        && existing.as_ref().map_or(true, |e| !env.is_local_domain(&e.domain));
    if joins_here {
        let ctx = env.context(signer).await?;
        let policies: Vec<&str> = env.config.registration_policy.as_deref().into_iter().collect();
        let decision = env
            .policy
            .decide(PolicyTarget::Entity, Action::Register, &policies, &ctx);
        ensure_allowed(&decision, &format!("registration on {}", env.config.domain))?;
    }

    let entity = Entity {
        ccid: signer.to_string(),
        domain: doc.domain.clone(),
        tag: existing.as_ref().map(|e| e.tag.clone()).unwrap_or_default(),
        score: existing.as_ref().map_or(0, |e| e.score),
        affiliation_document: env.raw.to_string(),
        affiliation_signature: env.signature.to_string(),
        tombstone_document: None,
        tombstone_signature: None,
        alias: existing.as_ref().and_then(|e| e.alias.clone()),
        cdate: existing.as_ref().map_or(doc.base.signed_at, |e| e.cdate),
        mdate: doc.base.signed_at,
    };

    let mut plan = Plan::new(&entity)?;
    plan.created = existing.is_none();
    plan.owner(signer);
    if !env.is_local_domain(&doc.domain) {
        plan.remote_domains.insert(doc.domain.clone());
    }
    plan.mutations.push(Mutation::UpsertEntity(entity));
    Ok(plan)
}

pub(super) async fn tombstone<S: Store>(env: &Env<'_, S>, doc: &TombstoneDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let mut entity = env
        .store
        .get_entity(signer)
        .await?
        .ok_or_else(|| NodeError::NotFound(format!("entity {}", signer)))?;
    if entity.is_tombstoned() {
        return Err(NodeError::AlreadyDeleted(format!("entity {}", signer)));
    }

    entity.tombstone_document = Some(env.raw.to_string());
    entity.tombstone_signature = Some(env.signature.to_string());
    entity.mdate = doc.base.signed_at;

    let mut plan = Plan::new(&entity)?;
    plan.owner(signer);
    if !env.is_local_domain(&entity.domain) {
        plan.remote_domains.insert(entity.domain.clone());
    }
    plan.mutations.push(Mutation::TombstoneEntity {
        ccid: entity.ccid,
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        at: doc.base.signed_at,
    });
    Ok(plan)
}
