//! Directed entity-to-entity acks, last writer wins per `(from, to)`.

use conode_core::{Ack, AckDocument};
use conode_store::{Mutation, Store};
use tracing::debug;

use super::{Env, Plan};
use crate::error::{NodeError, Result};

fn check_from(doc: &AckDocument) -> Result<()> {
    if doc.from != doc.base.signer {
        return Err(NodeError::PermissionDenied(format!(
            "{} cannot ack on behalf of {}",
            doc.base.signer, doc.from
        )));
    }
    Ok(())
}

pub(super) async fn ack<S: Store>(env: &Env<'_, S>, doc: &AckDocument) -> Result<Plan> {
    check_from(doc)?;
    if let Some(existing) = env.store.get_ack(&doc.from, &doc.to).await? {
        if existing.cdate > doc.base.signed_at {
            debug!(from = %doc.from, to = %doc.to, "newer ack exists");
            return Plan::unchanged(&existing);
        }
    }

    let ack = Ack {
        from: doc.from.clone(),
        to: doc.to.clone(),
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        cdate: doc.base.signed_at,
    };
    let mut plan = Plan::new(&ack)?;
    plan.created = true;
    plan.owner(doc.from.clone()).owner(doc.to.clone());
    if let Some(domain) = env.remote_home(&doc.to).await? {
        plan.remote_domains.insert(domain);
    }
    plan.mutations.push(Mutation::UpsertAck(ack));
    Ok(plan)
}

pub(super) async fn unack<S: Store>(env: &Env<'_, S>, doc: &AckDocument) -> Result<Plan> {
    check_from(doc)?;
    let existing = env.store.get_ack(&doc.from, &doc.to).await?;
    if let Some(existing) = &existing {
        if existing.cdate > doc.base.signed_at {
            debug!(from = %doc.from, to = %doc.to, "ack is newer than unack");
            return Plan::unchanged(existing);
        }
    }

    let mut plan = Plan::new(serde_json::json!({"from": doc.from, "to": doc.to}))?;
    plan.owner(doc.from.clone()).owner(doc.to.clone());
    if let Some(domain) = env.remote_home(&doc.to).await? {
        plan.remote_domains.insert(domain);
    }
    plan.mutations.push(Mutation::DeleteAck {
        from: doc.from.clone(),
        to: doc.to.clone(),
    });
    Ok(plan)
}
