use conode_core::EventDocument;
use conode_policy::Action;
use conode_store::Store;

use super::{Env, Plan};
use crate::error::{NodeError, Result};

/// Ephemeral events are published and forwarded, never stored.
pub(super) async fn publish<S: Store>(env: &Env<'_, S>, doc: &EventDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let timeline = env.broker.normalize(&doc.timeline).await?;

    let mut plan = Plan::new(&doc.body)?;
    plan.owner(signer);

    let (Some(id), true) = (timeline.resolved, timeline.is_local) else {
        plan.remote_domains.insert(timeline.domain.clone());
        return Ok(plan);
    };

    let record = env
        .store
        .get_timeline(&id)
        .await?
        .ok_or_else(|| NodeError::NotFound(format!("timeline {}", doc.timeline)))?;
    env.broker
        .authorize_as(&record, Action::Event, env.context(signer).await?)?;

    plan.events.push(env.event(&timeline, None, &plan.resource));
    plan.touch(&timeline);
    Ok(plan)
}
