//! Removal of derived state. The commit log keeps every document.

use conode_core::{DeleteDocument, ResourceKind, RetractDocument};
use conode_policy::Action;
use conode_store::{Mutation, Store};

use super::{load_record, policy_target, Env, Plan};
use crate::error::{NodeError, Result};

pub(super) async fn delete<S: Store>(env: &Env<'_, S>, doc: &DeleteDocument) -> Result<Plan> {
    let target = doc.target;
    let Some(record) = load_record(env.store, &target).await? else {
        let key = target.to_string();
        return Err(if env.store.is_deleted(&key).await? {
            NodeError::AlreadyDeleted(key)
        } else {
            NodeError::NotFound(key)
        });
    };

    env.authorize_record(policy_target(target.kind()), Action::Delete, &record)
        .await?;

    let mut plan = Plan::new(&record.value)?;
    plan.owner(doc.base.signer.clone()).owner(record.owner.clone());
    if let Some(owner) = &record.target_owner {
        plan.owner(owner.clone());
        if let Some(domain) = env.remote_home(owner).await? {
            plan.remote_domains.insert(domain);
        }
    }

    plan.mutations.push(match target.kind() {
        ResourceKind::Message => Mutation::DeleteMessage(target),
        ResourceKind::Association => Mutation::DeleteAssociation(target),
        ResourceKind::Profile => Mutation::DeleteProfile(target),
        ResourceKind::Timeline => Mutation::DeleteTimeline(target),
        ResourceKind::Subscription => Mutation::DeleteSubscription(target),
    });
    plan.mutations.push(Mutation::DeleteTimelineItemsForResource(target));
    plan.mutations.push(Mutation::RecordDeletion {
        target: target.to_string(),
        document_id: env.document_id,
        at: doc.base.signed_at,
    });

    // Viewers of the timelines the record was on hear about the removal.
    for raw in &record.timelines {
        let Ok(timeline) = env.broker.normalize(raw).await else {
            continue;
        };
        if timeline.is_local {
            plan.events.push(env.event(&timeline, None, &plan.resource));
            plan.touch(&timeline);
        } else {
            plan.remote_domains.insert(timeline.domain.clone());
        }
    }
    Ok(plan)
}

/// Take one item off a timeline. The item's owner and the timeline's owner
/// may both do this.
pub(super) async fn retract<S: Store>(env: &Env<'_, S>, doc: &RetractDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let timeline = env.broker.normalize(&doc.timeline).await?;

    let (Some(timeline_id), true) = (timeline.resolved, timeline.is_local) else {
        let mut plan = Plan::new(serde_json::json!({
            "timelineID": doc.timeline,
            "resourceID": doc.target,
        }))?;
        plan.owner(signer);
        plan.remote_domains.insert(timeline.domain.clone());
        return Ok(plan);
    };

    let key = timeline_id.to_string();
    let item = env
        .store
        .get_timeline_item(&key, &doc.target)
        .await?
        .ok_or_else(|| NodeError::NotFound(format!("{} on {}", doc.target, doc.timeline)))?;
    let record = env
        .store
        .get_timeline(&timeline_id)
        .await?
        .ok_or_else(|| NodeError::NotFound(format!("timeline {}", doc.timeline)))?;

    if signer != item.owner && signer != record.author {
        return Err(NodeError::PermissionDenied(format!(
            "{} may not retract from {}",
            signer, doc.timeline
        )));
    }

    let mut plan = Plan::new(&item)?;
    plan.owner(signer).owner(item.owner.clone());
    plan.mutations.push(Mutation::DeleteTimelineItem {
        timeline_id: key,
        resource_id: doc.target,
    });
    plan.events.push(env.event(&timeline, Some(item), &plan.resource));
    plan.touch(&timeline);
    Ok(plan)
}
