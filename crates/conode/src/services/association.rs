use conode_core::{
    keccak256, Association, AssociationDocument, AssociationKey, ResourceKind, TimelineItem,
};
use conode_policy::Action;
use conode_store::{Mutation, Store};
use serde_json::Value;
use tracing::debug;

use super::{load_record, policy_target, post_to_timelines, Env, Plan};
use crate::error::{NodeError, Result};

/// Semantic timeline an entity receives reactions on.
pub(crate) const NOTIFICATION_TIMELINE: &str = "notification";

/// First 32 hex chars of the body's Keccak-256.
pub(crate) fn unique_of(body: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    let mut unique = hex::encode(keccak256(&bytes));
    unique.truncate(32);
    Ok(unique)
}

pub(super) async fn create<S: Store>(env: &Env<'_, S>, doc: &AssociationDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let key = AssociationKey {
        author: signer.to_string(),
        target: doc.target,
        schema: doc.schema.clone(),
        variant: doc.variant.clone(),
        unique: unique_of(&doc.body)?,
    };

    if let Some(existing) = env.store.find_association(&key).await? {
        debug!(association = %existing.id, "equivalent association exists");
        return Plan::unchanged(&existing);
    }

    let target = load_record(env.store, &doc.target).await?;
    let owner_home = env.remote_home(&doc.owner).await?;
    match &target {
        Some(record) => {
            if record.owner != doc.owner {
                return Err(NodeError::Malformed(format!(
                    "owner: {} does not own {}",
                    doc.owner, doc.target
                )));
            }
            env.authorize_record(policy_target(doc.target.kind()), Action::Associate, record)
                .await?;
        }
        // The target lives on its owner's domain.
        None if owner_home.is_some() => {}
        None => return Err(NodeError::NotFound(format!("target {}", doc.target))),
    }

    let association = Association {
        id: env.id(ResourceKind::Association),
        author: signer.to_string(),
        owner: doc.owner.clone(),
        schema: key.schema,
        target: doc.target,
        variant: key.variant,
        unique: key.unique,
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        timelines: doc.timelines.clone(),
        cdate: doc.base.signed_at,
    };

    let mut plan = Plan::new(&association)?;
    plan.created = true;
    plan.owner(signer).owner(doc.owner.clone());
    plan.mutations.push(Mutation::InsertAssociation(association.clone()));
    if let Some(domain) = &owner_home {
        plan.remote_domains.insert(domain.clone());
    }

    post_to_timelines(
        env,
        &mut plan,
        association.id,
        &association.owner,
        &association.schema,
        association.cdate,
        &doc.timelines,
    )
    .await?;

    // Viewers of the target's timelines see the reaction without an item.
    if let Some(record) = &target {
        for raw in &record.timelines {
            let Ok(timeline) = env.broker.normalize(raw).await else {
                continue;
            };
            if timeline.is_local {
                plan.events.push(env.event(&timeline, None, &plan.resource));
            }
        }
    }

    // The owner's notification timeline, when hosted here.
    if owner_home.is_none() {
        let notification = env
            .store
            .find_semantic(ResourceKind::Timeline, &doc.owner, NOTIFICATION_TIMELINE)
            .await?;
        if let Some(id) = notification {
            let timeline = env.broker.normalize(&id.to_string()).await?;
            let key = id.to_string();
            if !plan.local_timelines.contains(&key) {
                let item = TimelineItem {
                    resource_id: association.id,
                    timeline_id: key,
                    owner: association.owner.clone(),
                    author: Some(signer.to_string()),
                    schema: association.schema.clone(),
                    cdate: association.cdate,
                };
                plan.mutations.push(Mutation::InsertTimelineItem(item.clone()));
                plan.events.push(env.event(&timeline, Some(item), &plan.resource));
                plan.touch(&timeline);
            }
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unique_is_stable_and_short() {
        let a = unique_of(&json!({"shortcode": "like"})).unwrap();
        let b = unique_of(&json!({"shortcode": "like"})).unwrap();
        let c = unique_of(&json!({"shortcode": "love"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
