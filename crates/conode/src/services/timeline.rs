use conode_core::{ResourceKind, Timeline, TimelineDocument};
use conode_policy::{Action, PolicyTarget};
use conode_store::{Mutation, Store};
use tracing::debug;

use super::{resolve_mutable, Env, Plan};
use crate::error::{NodeError, Result};

pub(super) async fn upsert<S: Store>(env: &Env<'_, S>, doc: &TimelineDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let semantic_id = doc.base.semantic_id.as_deref();
    let (id, existing) =
        resolve_mutable(env, ResourceKind::Timeline, doc.id.as_deref(), semantic_id, signer).await?;
    env.ensure_domain_owner(doc.domain_owned)?;

    match &existing {
        Some(record) => {
            env.authorize_record(PolicyTarget::Timeline, Action::Update, record)
                .await?;
            if record.is_newer_than(doc.base.signed_at) {
                debug!(timeline = %record.id, "newer timeline exists");
                return Plan::unchanged(&record.value);
            }
        }
        None => {
            // Timelines live on their owner's home domain.
            let home = env.store.get_entity(signer).await?.map(|e| e.domain);
            if home.as_deref() != Some(env.config.domain.as_str()) {
                return Err(NodeError::PermissionDenied(format!(
                    "{} is not registered on {}",
                    signer, env.config.domain
                )));
            }
        }
    }

    let timeline = Timeline {
        id,
        author: existing
            .as_ref()
            .map_or_else(|| signer.to_string(), |r| r.owner.clone()),
        schema: doc.schema.clone(),
        semantic_id: doc.base.semantic_id.clone(),
        indexable: doc.indexable,
        domain_owned: doc.domain_owned,
        policy: doc.base.policy.clone(),
        policy_params: doc.base.policy_params.clone(),
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        cdate: existing.as_ref().map_or(doc.base.signed_at, |r| r.cdate),
        mdate: doc.base.signed_at,
    };

    let mut plan = Plan::new(&timeline)?;
    plan.created = existing.is_none();
    plan.owner(timeline.author.clone());
    plan.mutations.push(Mutation::UpsertTimeline(timeline));
    Ok(plan)
}
