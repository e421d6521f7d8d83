use conode_core::{Message, MessageDocument, ResourceKind};
use conode_store::{Mutation, Store};

use super::{post_to_timelines, Env, Plan};
use crate::error::Result;

pub(super) async fn create<S: Store>(env: &Env<'_, S>, doc: &MessageDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let message = Message {
        id: env.id(ResourceKind::Message),
        author: signer.to_string(),
        schema: doc.schema.clone(),
        policy: doc.base.policy.clone(),
        policy_params: doc.base.policy_params.clone(),
        document: env.raw.to_string(),
        signature: env.signature.to_string(),
        timelines: doc.timelines.clone(),
        cdate: doc.base.signed_at,
    };

    let mut plan = Plan::new(&message)?;
    plan.created = true;
    plan.owner(signer);
    plan.mutations.push(Mutation::InsertMessage(message.clone()));
    post_to_timelines(
        env,
        &mut plan,
        message.id,
        signer,
        &message.schema,
        message.cdate,
        &doc.timelines,
    )
    .await?;
    Ok(plan)
}
