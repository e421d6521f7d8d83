use conode_core::{
    is_ccid, ResolverType, ResourceKind, SubscribeDocument, Subscription, SubscriptionDocument,
    SubscriptionItem, TypedId,
};
use conode_fanout::timeline_domain;
use conode_policy::{Action, PolicyTarget};
use conode_store::{Mutation, Store};
use tracing::debug;

use super::{load_record, resolve_mutable, Env, Plan};
use crate::context::Origin;
use crate::error::{NodeError, Result};

pub(super) async fn upsert<S: Store>(env: &Env<'_, S>, doc: &SubscriptionDocument) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let semantic_id = doc.base.semantic_id.as_deref();
    let (id, existing) = resolve_mutable(
        env,
        ResourceKind::Subscription,
        doc.id.as_deref(),
        semantic_id,
        signer,
    )
    .await?;
    env.ensure_domain_owner(doc.domain_owned)?;

    if let Some(record) = &existing {
        env.authorize_record(PolicyTarget::Subscription, Action::Update, record)
            .await?;
        if record.is_newer_than(doc.base.signed_at) {
            debug!(subscription = %record.id, "newer subscription exists");
            return Plan::unchanged(&record.value);
        }
    }

    let subscription = Subscription {
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

    let mut plan = Plan::new(&subscription)?;
    plan.created = existing.is_none();
    plan.owner(subscription.author.clone());
    plan.mutations.push(Mutation::UpsertSubscription(subscription));
    Ok(plan)
}

/// The item a `subscribe` document adds.
///
/// `semantic@ccid` targets resolve through the entity; anything else through
/// the domain in the id, or this domain for bare ids.
fn item_for(
    doc: &SubscribeDocument,
    local_domain: &str,
    subscriber_domain: Option<String>,
) -> SubscriptionItem {
    let entity = doc
        .target
        .rsplit_once('@')
        .map(|(_, tail)| tail)
        .filter(|tail| is_ccid(tail));

    let (resolver, entity, domain) = match entity {
        Some(ccid) => (ResolverType::Entity, Some(ccid.to_string()), None),
        None => (
            ResolverType::Domain,
            None,
            Some(timeline_domain(&doc.target).unwrap_or(local_domain).to_string()),
        ),
    };

    SubscriptionItem {
        id: doc.target.clone(),
        subscription: doc.subscription.clone(),
        resolver,
        entity,
        domain,
        subscriber_domain,
    }
}

pub(super) async fn subscribe<S: Store>(env: &Env<'_, S>, doc: &SubscribeDocument) -> Result<Plan> {
    change(env, doc, true).await
}

pub(super) async fn unsubscribe<S: Store>(
    env: &Env<'_, S>,
    doc: &SubscribeDocument,
) -> Result<Plan> {
    change(env, doc, false).await
}

async fn change<S: Store>(env: &Env<'_, S>, doc: &SubscribeDocument, add: bool) -> Result<Plan> {
    let signer = doc.base.signer.as_str();
    let target = env.broker.normalize(&doc.target).await?;

    let item = match env.origin {
        // A peer telling the host that its users follow a local timeline. The
        // subscription itself lives on the peer.
        Origin::Peer(peer) => {
            if !target.is_local {
                return Err(NodeError::PermissionDenied(format!(
                    "{} is not hosted on {}",
                    doc.target, env.config.domain
                )));
            }
            item_for(doc, &env.config.domain, Some(peer.clone()))
        }
        Origin::Client => {
            let id = TypedId::parse(&doc.subscription)?;
            if id.kind() != ResourceKind::Subscription {
                return Err(NodeError::Malformed(format!(
                    "subscription: {} is not a subscription id",
                    doc.subscription
                )));
            }
            let record = load_record(env.store, &id)
                .await?
                .ok_or_else(|| NodeError::NotFound(format!("subscription {}", doc.subscription)))?;
            env.authorize_record(PolicyTarget::Subscription, Action::Subscribe, &record)
                .await?;
            item_for(doc, &env.config.domain, None)
        }
    };

    let mut plan = Plan::new(&item)?;
    plan.created = add;
    plan.owner(signer);
    if !target.is_local {
        plan.remote_domains.insert(target.domain.clone());
    }
    plan.mutations.push(if add {
        Mutation::InsertSubscriptionItem(item)
    } else {
        Mutation::DeleteSubscriptionItem {
            subscription: doc.subscription.clone(),
            id: doc.target.clone(),
        }
    });
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conode_core::{DocumentBase, DocumentKind, Keypair};

    fn doc(target: &str) -> SubscribeDocument {
        SubscribeDocument {
            base: DocumentBase {
                signer: "con1signer".into(),
                kind: DocumentKind::Subscribe,
                key_id: None,
                meta: None,
                semantic_id: None,
                signed_at: Utc::now(),
                policy: None,
                policy_params: None,
            },
            subscription: "s0".into(),
            target: target.into(),
        }
    }

    #[test]
    fn test_resolvers() {
        let bare = item_for(&doc("t1"), "a.example", None);
        assert_eq!(bare.resolver, ResolverType::Domain);
        assert_eq!(bare.domain.as_deref(), Some("a.example"));

        let remote = item_for(&doc("t1@b.example"), "a.example", Some("c.example".into()));
        assert_eq!(remote.domain.as_deref(), Some("b.example"));
        assert_eq!(remote.subscriber_domain.as_deref(), Some("c.example"));

        let ccid = Keypair::generate().ccid();
        let semantic = item_for(&doc(&format!("home@{}", ccid)), "a.example", None);
        assert_eq!(semantic.resolver, ResolverType::Entity);
        assert_eq!(semantic.entity, Some(ccid));
        assert_eq!(semantic.domain, None);
    }
}
