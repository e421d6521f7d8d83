use conode_core::{Profile, ProfileDocument, ResourceKind};
use conode_policy::{Action, PolicyTarget};
use conode_store::{Mutation, Store};
use tracing::debug;

use super::{resolve_mutable, Env, Plan};
use crate::error::Result;

pub(super) async fn upsert<S: Store>(env: &Env<'_, S>, doc: &ProfileDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let semantic_id = doc.base.semantic_id.as_deref();
    let (id, existing) =
        resolve_mutable(env, ResourceKind::Profile, doc.id.as_deref(), semantic_id, signer).await?;

    if let Some(record) = &existing {
        env.authorize_record(PolicyTarget::Profile, Action::Update, record)
            .await?;
        if record.is_newer_than(doc.base.signed_at) {
            debug!(profile = %record.id, "newer profile exists");
            return Plan::unchanged(&record.value);
        }
    }

    let profile = Profile {
        id,
        author: existing
            .as_ref()
            .map_or_else(|| signer.to_string(), |r| r.owner.clone()),
        schema: doc.schema.clone(),
        semantic_id: doc.base.semantic_id.clone(),
        policy: doc.base.policy.clone(),
        policy_params: doc.base.policy_params.clone(),
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        cdate: existing.as_ref().map_or(doc.base.signed_at, |r| r.cdate),
        mdate: doc.base.signed_at,
    };

    let mut plan = Plan::new(&profile)?;
    plan.created = existing.is_none();
    plan.owner(profile.author.clone());
    plan.mutations.push(Mutation::UpsertProfile(profile));
    Ok(plan)
}
