//! End-to-end commit scenarios against an in-memory node.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use conode::core::{Cdid, CommitMode, ErrorKind, ResourceKind, TypedId};
use conode::fanout::memory::MemoryPeerNetwork;
use conode::fanout::PeerClient;
use conode::store::{MemoryStore, SqliteStore, Store};
use conode::{ApiResponse, CommitContext, CommitOutcome, CommitRequest, Node, NodeConfig, Result};
use conode_testkit::{owner_only_post_policy, SignedDocument, TestIdentity};
use tokio::sync::mpsc;

const DOMAIN: &str = "domain-a";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn node() -> Node<MemoryStore> {
    init_tracing();
    Node::new(NodeConfig::for_domain(DOMAIN), MemoryStore::new(), None)
}

/// A node whose domain entity is `who`.
fn node_with_domain_key(who: &TestIdentity) -> Node<MemoryStore> {
    init_tracing();
    let config = NodeConfig {
        domain_ccid: Some(who.ccid.clone()),
        ..NodeConfig::for_domain(DOMAIN)
    };
    Node::new(config, MemoryStore::new(), None)
}

async fn commit<S: Store>(node: &Node<S>, signed: &SignedDocument) -> Result<CommitOutcome> {
    node.commit(
        &CommitContext::client(),
        CommitMode::Execute,
        &signed.document,
        &signed.signature,
        None,
    )
    .await
}

/// Register `who` on `domain` and give them a timeline.
async fn setup_timeline<S: Store>(
    node: &Node<S>,
    who: &TestIdentity,
    builder: conode_testkit::DocumentBuilder,
) -> String {
    commit(node, &who.sign(who.affiliation(node.config().domain.as_str())))
        .await
        .unwrap();
    let outcome = commit(node, &who.sign(builder)).await.unwrap();
    assert_eq!(outcome.status, 201);
    outcome.resource["id"].as_str().unwrap().to_string()
}

fn resource_id(outcome: &CommitOutcome) -> TypedId {
    outcome.resource["id"].as_str().unwrap().parse().unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Root key
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_commit_message_with_root_key() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;

    let signed = alice.sign(alice.message("hello", &[timeline.as_str()]));
    let outcome = commit(&node, &signed).await.unwrap();
    assert_eq!(outcome.status, 201);
    assert!(outcome.created);

    let id = resource_id(&outcome);
    assert_eq!(id.kind(), ResourceKind::Message);
    let message = node.store().get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.author, alice.ccid);
    assert_eq!(message.document, signed.document);

    let items = node
        .store()
        .timeline_items_before(&[timeline.clone()], Utc::now() + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].resource_id, id);
    assert_eq!(items[0].timeline_id, timeline);

    let log = node.get_commit(&outcome.document_id).await.unwrap().unwrap();
    assert_eq!(log.owners, vec![alice.ccid.clone()]);
    assert_eq!(log.document, signed.document);
}

#[tokio::test]
async fn test_commit_on_sqlite() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("conode.db")).unwrap();
    let node = Node::new(NodeConfig::for_domain(DOMAIN), store, None);
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;

    let outcome = commit(&node, &alice.sign(alice.message("on disk", &[timeline.as_str()])))
        .await
        .unwrap();
    let items = node
        .recent_items(Some(&alice.ccid), &[timeline], Utc::now() + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].resource_id, resource_id(&outcome));
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let node = node();
    let alice = TestIdentity::new();
    let mallory = TestIdentity::new();

    let mut signed = alice.sign(alice.affiliation(DOMAIN));
    signed.signature = mallory.sign(alice.affiliation(DOMAIN)).signature;

    let err = commit(&node, &signed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    assert!(node.store().get_entity(&alice.ccid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_post_to_unknown_timeline() {
    let node = node();
    let alice = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    let missing = TypedId::new(ResourceKind::Timeline, Cdid::make()).to_string();
    let err = commit(&node, &alice.sign(alice.message("lost", &[missing.as_str()])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_semantic_timeline_address() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;

    let semantic = format!("home@{}", alice.ccid);
    let outcome = commit(&node, &alice.sign(alice.message("by name", &[semantic.as_str()])))
        .await
        .unwrap();

    let item = node
        .store()
        .get_timeline_item(&timeline, &resource_id(&outcome))
        .await
        .unwrap();
    assert!(item.is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Subkeys
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subkey_signing_and_revocation() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;
    let sub = alice.subkey();

    let enact = alice.sign(alice.enact(&sub.ckid).signed_after(Duration::seconds(-5)));
    assert_eq!(commit(&node, &enact).await.unwrap().status, 201);
    let key = node.store().get_key(&sub.ckid).await.unwrap().unwrap();
    assert_eq!(key.root, alice.ccid);

    let accepted = sub.sign(
        alice
            .message("from subkey", &[timeline.as_str()])
            .signed_after(Duration::seconds(-2)),
    );
    assert_eq!(commit(&node, &accepted).await.unwrap().status, 201);

    let revoke = alice.sign(alice.revoke(&sub.ckid).signed_after(Duration::seconds(-1)));
    commit(&node, &revoke).await.unwrap();

    let rejected = sub.sign(alice.message("too late", &[timeline.as_str()]));
    let err = commit(&node, &rejected).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Revoking twice is reported, not repeated.
    let again = alice.sign(alice.revoke(&sub.ckid));
    assert_eq!(commit(&node, &again).await.unwrap_err().kind(), ErrorKind::AlreadyDeleted);
}

#[tokio::test]
async fn test_unknown_subkey_is_rejected() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;
    let sub = alice.subkey();

    let signed = sub.sign(alice.message("never enacted", &[timeline.as_str()]));
    let err = commit(&node, &signed).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::PermissionDenied
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Federation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cross_domain_association_is_forwarded() {
    init_tracing();
    let network = MemoryPeerNetwork::new();
    let peer: Arc<dyn PeerClient> = Arc::new(network.client());
    let node = Node::new(NodeConfig::for_domain(DOMAIN), MemoryStore::new(), Some(peer));

    let author = TestIdentity::new();
    let owner = TestIdentity::new();
    commit(&node, &author.sign(author.affiliation(DOMAIN))).await.unwrap();
    // The owner's home is remote; its affiliation is cached here and sent home.
    commit(&node, &owner.sign(owner.affiliation("domain-b"))).await.unwrap();

    let target = TypedId::new(ResourceKind::Message, Cdid::make()).to_string();
    let signed = author.sign(author.association(
        &target,
        &owner.ccid,
        serde_json::json!({ "emoji": "+1" }),
        &[],
    ));
    let outcome = commit(&node, &signed).await.unwrap();
    assert_eq!(outcome.status, 201);
    assert!(outcome.warnings.is_empty());

    let delivered = network
        .wait_for_commits("domain-b", 2, StdDuration::from_secs(10))
        .await;
    assert_eq!(delivered.len(), 2);
    let request: CommitRequest = serde_json::from_slice(&delivered[1].body).unwrap();
    assert_eq!(request.document, signed.document);
    assert_eq!(request.signature, signed.signature);
    assert!(network.commits_to(DOMAIN).is_empty());
}

#[tokio::test]
async fn test_local_only_defers_peer_delivery() {
    init_tracing();
    let network = MemoryPeerNetwork::new();
    let peer: Arc<dyn PeerClient> = Arc::new(network.client());
    let node = Node::new(NodeConfig::for_domain(DOMAIN), MemoryStore::new(), Some(peer));

    let remote = TestIdentity::new();
    let signed = remote.sign(remote.affiliation("domain-b"));
    let outcome = node
        .commit(
            &CommitContext::client(),
            CommitMode::LocalOnlyExec,
            &signed.document,
            &signed.signature,
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, 201);
    assert!(outcome.warnings[0].starts_with("peer delivery deferred"));
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(network.commits().is_empty());
}

#[tokio::test]
async fn test_peer_origin_is_not_echoed() {
    init_tracing();
    let network = MemoryPeerNetwork::new();
    let peer: Arc<dyn PeerClient> = Arc::new(network.client());
    let node = Node::new(NodeConfig::for_domain(DOMAIN), MemoryStore::new(), Some(peer));

    let remote = TestIdentity::new();
    let signed = remote.sign(remote.affiliation("domain-b"));
    let outcome = node
        .commit(
            &CommitContext::from_peer("domain-b"),
            CommitMode::Execute,
            &signed.document,
            &signed.signature,
            None,
        )
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty());
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(network.commits_to("domain-b").is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Realtime
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_realtime_delivers_exact_commit() {
    let owner = TestIdentity::new();
    let node = Arc::new(node_with_domain_key(&owner));
    let timeline = setup_timeline(
        &node,
        &owner,
        owner.timeline("public").field("domainOwned", true),
    )
    .await;

    let reader = TestIdentity::new();
    let (req_tx, req_rx) = mpsc::channel(4);
    let (ev_tx, mut ev_rx) = mpsc::channel(16);
    let conn = {
        let node = Arc::clone(&node);
        let requester = reader.ccid.clone();
        tokio::spawn(async move { node.realtime(Some(requester), req_rx, ev_tx).await })
    };
    req_tx.send(vec![timeline.clone()]).await.unwrap();
    while node.hub().subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let poster = TestIdentity::new();
    commit(&node, &poster.sign(poster.affiliation(DOMAIN))).await.unwrap();
    let signed = poster.sign(poster.message("live", &[timeline.as_str()]));
    commit(&node, &signed).await.unwrap();

    let event = tokio::time::timeout(StdDuration::from_secs(1), ev_rx.recv())
        .await
        .expect("event within a second")
        .unwrap();
    assert_eq!(event.document, signed.document);
    assert_eq!(event.signature, signed.signature);
    assert_eq!(event.timeline, format!("{}@{}", timeline, DOMAIN));
    assert_eq!(event.item.unwrap().owner, poster.ccid);

    drop(req_tx);
    tokio::time::timeout(StdDuration::from_secs(1), conn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.hub().subscriber_count(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeline_policy_denies_non_owner() {
    let owner = TestIdentity::new();
    let node = node_with_domain_key(&owner);
    let timeline = setup_timeline(
        &node,
        &owner,
        owner
            .timeline("announcements")
            .field("domainOwned", true)
            .policy(owner_only_post_policy(&owner.ccid)),
    )
    .await;

    let bob = TestIdentity::new();
    commit(&node, &bob.sign(bob.affiliation(DOMAIN))).await.unwrap();
    let signed = bob.sign(bob.message("let me in", &[timeline.as_str()]));
    let (status, body) = node
        .handle_commit(
            &CommitContext::client(),
            CommitMode::Execute,
            &CommitRequest {
                document: signed.document,
                signature: signed.signature,
                option: None,
            },
        )
        .await;
    assert_eq!(status, 403);
    assert!(matches!(body, ApiResponse::Error { .. }));

    let own = owner.sign(owner.message("welcome", &[timeline.as_str()]));
    assert_eq!(commit(&node, &own).await.unwrap().status, 201);
}

#[tokio::test]
async fn test_closed_registration() {
    init_tracing();
    let config = NodeConfig {
        registration_open: false,
        ..NodeConfig::for_domain(DOMAIN)
    };
    let node = Node::new(config, MemoryStore::new(), None);
    let alice = TestIdentity::new();

    let err = commit(&node, &alice.sign(alice.affiliation(DOMAIN)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Caching a remote entity needs no registration.
    commit(&node, &alice.sign(alice.affiliation("domain-b"))).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay and deletion
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idempotent_replay() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;
    let signed = alice.sign(alice.message("once", &[timeline.as_str()]));

    let first = commit(&node, &signed).await.unwrap();
    let logs = node.store().commits_for_owner(&alice.ccid, 100).await.unwrap().len();

    let second = commit(&node, &signed).await.unwrap();
    assert_eq!(second.status, 200);
    assert!(!second.created);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(resource_id(&second), resource_id(&first));
    assert_eq!(
        node.store().commits_for_owner(&alice.ccid, 100).await.unwrap().len(),
        logs
    );

    let (status, body) = ApiResponse::from_commit(&Ok(second));
    assert_eq!(status, 200);
    assert!(matches!(body, ApiResponse::Ok { .. }));
}

#[tokio::test]
async fn test_delete_then_delete_again() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;
    let outcome = commit(&node, &alice.sign(alice.message("bye", &[timeline.as_str()])))
        .await
        .unwrap();
    let id = resource_id(&outcome).to_string();

    commit(&node, &alice.sign(alice.delete(&id))).await.unwrap();
    assert!(node.store().get_message(&resource_id(&outcome)).await.unwrap().is_none());
    let items = node
        .store()
        .timeline_items_before(&[timeline], Utc::now() + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert!(items.is_empty());

    let err = commit(&node, &alice.sign(alice.delete(&id))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDeleted);

    let missing = TypedId::new(ResourceKind::Message, Cdid::make()).to_string();
    let err = commit(&node, &alice.sign(alice.delete(&missing))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let node = node();
    let alice = TestIdentity::new();
    let signed = alice.sign(alice.affiliation(DOMAIN));

    let outcome = node
        .commit(
            &CommitContext::client(),
            CommitMode::DryRun,
            &signed.document,
            &signed.signature,
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert!(node.get_commit(&outcome.document_id).await.unwrap().is_none());
    assert!(node.store().get_entity(&alice.ccid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_deadline() {
    let node = node();
    let alice = TestIdentity::new();
    let signed = alice.sign(alice.affiliation(DOMAIN));
    let ctx = CommitContext::client().with_timeout(StdDuration::ZERO);
    tokio::time::sleep(StdDuration::from_millis(1)).await;

    let err = node
        .commit(&ctx, CommitMode::Execute, &signed.document, &signed.signature, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn test_tombstoned_entity_cannot_commit() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;

    commit(&node, &alice.sign(alice.tombstone())).await.unwrap();
    let err = commit(&node, &alice.sign(alice.message("ghost", &[timeline.as_str()])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutable records
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_older_profile_does_not_overwrite_newer() {
    let node = node();
    let alice = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    let newer = alice.sign(alice.profile("main", serde_json::json!({ "v": "new" })));
    let created = commit(&node, &newer).await.unwrap();
    assert_eq!(created.status, 201);

    let older = alice.sign(
        alice
            .profile("main", serde_json::json!({ "v": "old" }))
            .signed_after(Duration::seconds(-20)),
    );
    let outcome = commit(&node, &older).await.unwrap();
    assert_eq!(outcome.status, 200);
    assert!(!outcome.created);
    assert_eq!(resource_id(&outcome), resource_id(&created));
    assert!(node.get_commit(&outcome.document_id).await.unwrap().is_none());

    let stored = node.store().get_profile(&resource_id(&created)).await.unwrap().unwrap();
    assert_eq!(stored.document, newer.document);

    let latest = alice.sign(
        alice
            .profile("main", serde_json::json!({ "v": "latest" }))
            .signed_after(Duration::seconds(1)),
    );
    assert_eq!(commit(&node, &latest).await.unwrap().status, 201);
    let stored = node.store().get_profile(&resource_id(&created)).await.unwrap().unwrap();
    assert_eq!(stored.document, latest.document);
}

#[tokio::test]
async fn test_older_timeline_does_not_overwrite_newer() {
    let node = node();
    let alice = TestIdentity::new();
    let timeline = setup_timeline(&node, &alice, alice.timeline("home")).await;
    let id: TypedId = timeline.parse().unwrap();
    let before = node.store().get_timeline(&id).await.unwrap().unwrap();

    let older = alice.sign(
        alice
            .timeline("home")
            .field("indexable", true)
            .signed_after(Duration::seconds(-20)),
    );
    let outcome = commit(&node, &older).await.unwrap();
    assert_eq!(outcome.status, 200);

    let stored = node.store().get_timeline(&id).await.unwrap().unwrap();
    assert_eq!(stored.document, before.document);
    assert!(!stored.indexable);
}

#[tokio::test]
async fn test_older_subscription_does_not_overwrite_newer() {
    let node = node();
    let alice = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    let newer = alice.sign(alice.subscription("feed"));
    let created = commit(&node, &newer).await.unwrap();

    let older = alice.sign(
        alice
            .subscription("feed")
            .field("indexable", true)
            .signed_after(Duration::seconds(-20)),
    );
    let outcome = commit(&node, &older).await.unwrap();
    assert_eq!(outcome.status, 200);

    let stored = node
        .store()
        .get_subscription(&resource_id(&created))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.document, newer.document);
}

#[tokio::test]
async fn test_unreadable_policy_params_are_rejected() {
    let node = node();
    let alice = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    for params in ["not json", "[\"writers\"]"] {
        let signed = alice.sign(alice.timeline("home").field("policyParams", params));
        let err = commit(&node, &signed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed, "{}", params);
    }
    assert!(node
        .store()
        .find_semantic(ResourceKind::Timeline, &alice.ccid, "home")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_domain_owned_needs_domain_key() {
    let domain = TestIdentity::new();
    let node = node_with_domain_key(&domain);
    let alice = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    let claimed = alice.sign(alice.timeline("public").field("domainOwned", true));
    let err = commit(&node, &claimed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let claimed = alice.sign(alice.subscription("all").field("domainOwned", true));
    let err = commit(&node, &claimed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Without a configured domain key nobody may claim it.
    let open = Node::new(NodeConfig::for_domain(DOMAIN), MemoryStore::new(), None);
    commit(&open, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();
    let claimed = alice.sign(alice.timeline("public").field("domainOwned", true));
    assert_eq!(commit(&open, &claimed).await.unwrap_err().kind(), ErrorKind::PermissionDenied);

    let timeline = setup_timeline(
        &node,
        &domain,
        domain.timeline("public").field("domainOwned", true),
    )
    .await;
    let post = alice.sign(alice.message("anyone may post", &[timeline.as_str()]));
    assert_eq!(commit(&node, &post).await.unwrap().status, 201);
}

#[tokio::test]
async fn test_captcha_claim_reaches_policy() {
    let node = node();
    let owner = TestIdentity::new();
    let policy = serde_json::json!({
        "statements": [{
            "actions": ["post"],
            "effect": "allow",
            "condition": { "op": "isCaptchaVerified" }
        }]
    })
    .to_string();
    let timeline = setup_timeline(&node, &owner, owner.timeline("guestbook").policy(policy)).await;

    let guest = TestIdentity::new();
    commit(&node, &guest.sign(guest.affiliation(DOMAIN))).await.unwrap();

    let unverified = guest.sign(guest.message("hi", &[timeline.as_str()]));
    let err = commit(&node, &unverified).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let ctx = CommitContext::from_headers([("cc-captcha-verified", "true")]);
    let verified = guest.sign(guest.message("hi again", &[timeline.as_str()]));
    let outcome = node
        .commit(&ctx, CommitMode::Execute, &verified.document, &verified.signature, None)
        .await
        .unwrap();
    assert_eq!(outcome.status, 201);
}

// ─────────────────────────────────────────────────────────────────────────────
// Acks, associations and subscriptions
// ─────────────────────────────────────────────────────────────────────────────

fn unack(who: &TestIdentity, to: &str) -> conode_testkit::DocumentBuilder {
    who.document("unack").field("from", who.ccid.as_str()).field("to", to)
}

#[tokio::test]
async fn test_ack_is_last_write_wins() {
    let node = node();
    let alice = TestIdentity::new();
    let bob = TestIdentity::new();
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();

    let first = alice.sign(alice.ack(&bob.ccid).signed_after(Duration::seconds(-10)));
    assert_eq!(commit(&node, &first).await.unwrap().status, 201);

    let stale_ack = alice.sign(alice.ack(&bob.ccid).signed_after(Duration::seconds(-20)));
    assert_eq!(commit(&node, &stale_ack).await.unwrap().status, 200);
    let stored = node.store().get_ack(&alice.ccid, &bob.ccid).await.unwrap().unwrap();
    assert_eq!(stored.document, first.document);

    let stale_unack = alice.sign(unack(&alice, &bob.ccid).signed_after(Duration::seconds(-30)));
    assert_eq!(commit(&node, &stale_unack).await.unwrap().status, 200);
    assert!(node.store().get_ack(&alice.ccid, &bob.ccid).await.unwrap().is_some());

    commit(&node, &alice.sign(unack(&alice, &bob.ccid))).await.unwrap();
    assert!(node.store().get_ack(&alice.ccid, &bob.ccid).await.unwrap().is_none());

    // The pair is directed.
    assert!(node.store().get_ack(&bob.ccid, &alice.ccid).await.unwrap().is_none());

    let forged = bob.sign(bob.ack(&alice.ccid).field("from", alice.ccid.as_str()));
    let err = commit(&node, &forged).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_association_is_unique_per_body() {
    let node = node();
    let owner = TestIdentity::new();
    let fan = TestIdentity::new();
    let timeline = setup_timeline(&node, &owner, owner.timeline("home")).await;
    commit(&node, &fan.sign(fan.affiliation(DOMAIN))).await.unwrap();
    let message = commit(&node, &owner.sign(owner.message("post", &[timeline.as_str()])))
        .await
        .unwrap();
    let target = resource_id(&message);

    let like = |offset: i64, emoji: &str| {
        fan.sign(
            fan.association(
                &target.to_string(),
                &owner.ccid,
                serde_json::json!({ "emoji": emoji }),
                &[],
            )
            .signed_after(Duration::seconds(offset)),
        )
    };

    let first = commit(&node, &like(-3, "+1")).await.unwrap();
    assert_eq!(first.status, 201);
    let again = commit(&node, &like(-2, "+1")).await.unwrap();
    assert_eq!(again.status, 200);
    assert_eq!(resource_id(&again), resource_id(&first));
    assert_eq!(node.store().associations_for_target(&target).await.unwrap().len(), 1);

    assert_eq!(commit(&node, &like(-1, "heart")).await.unwrap().status, 201);
    assert_eq!(node.store().associations_for_target(&target).await.unwrap().len(), 2);

    // The named owner must own the target.
    let wrong = fan.sign(fan.association(
        &target.to_string(),
        &fan.ccid,
        serde_json::json!({ "emoji": "eyes" }),
        &[],
    ));
    assert_eq!(commit(&node, &wrong).await.unwrap_err().kind(), ErrorKind::Malformed);
}

#[tokio::test]
async fn test_timeline_owner_may_retract() {
    let node = node();
    let owner = TestIdentity::new();
    let open_post = r#"{"statements":[{"actions":["post"],"effect":"allow"}]}"#;
    let timeline = setup_timeline(&node, &owner, owner.timeline("wall").policy(open_post)).await;

    let bob = TestIdentity::new();
    let carol = TestIdentity::new();
    for who in [&bob, &carol] {
        commit(&node, &who.sign(who.affiliation(DOMAIN))).await.unwrap();
    }
    let posted = commit(&node, &bob.sign(bob.message("spam", &[timeline.as_str()])))
        .await
        .unwrap();
    let message = resource_id(&posted);
    let target = message.to_string();

    let err = commit(&node, &carol.sign(carol.retract(&timeline, &target)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    commit(&node, &owner.sign(owner.retract(&timeline, &target)))
        .await
        .unwrap();
    assert!(node
        .store()
        .get_timeline_item(&timeline, &message)
        .await
        .unwrap()
        .is_none());
    // Only the item goes; the message stays with its author.
    assert!(node.store().get_message(&message).await.unwrap().is_some());

    let err = commit(&node, &owner.sign(owner.retract(&timeline, &target)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe() {
    let node = node();
    let alice = TestIdentity::new();
    let bob = TestIdentity::new();
    let timeline = setup_timeline(&node, &bob, bob.timeline("home")).await;
    commit(&node, &alice.sign(alice.affiliation(DOMAIN))).await.unwrap();
    let subscription = commit(&node, &alice.sign(alice.subscription("feed")))
        .await
        .unwrap();
    let subscription = resource_id(&subscription).to_string();

    let outcome = commit(&node, &alice.sign(alice.subscribe(&subscription, &timeline)))
        .await
        .unwrap();
    assert_eq!(outcome.status, 201);
    let items = node.store().subscription_items(&subscription).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, timeline);
    assert_eq!(items[0].domain.as_deref(), Some(DOMAIN));

    // Only the subscription's owner may change it.
    let err = commit(&node, &bob.sign(bob.subscribe(&subscription, &timeline)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    commit(&node, &alice.sign(alice.unsubscribe(&subscription, &timeline)))
        .await
        .unwrap();
    assert!(node.store().subscription_items(&subscription).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_is_delivered_but_not_logged() {
    let node = Arc::new(node());
    let owner = TestIdentity::new();
    let timeline = setup_timeline(&node, &owner, owner.timeline("live")).await;

    let (req_tx, req_rx) = mpsc::channel(4);
    let (ev_tx, mut ev_rx) = mpsc::channel(16);
    let conn = {
        let node = Arc::clone(&node);
        let requester = owner.ccid.clone();
        tokio::spawn(async move { node.realtime(Some(requester), req_rx, ev_tx).await })
    };
    req_tx.send(vec![timeline.clone()]).await.unwrap();
    while node.hub().subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let signed = owner.sign(owner.event(&timeline, serde_json::json!({ "typing": true })));
    let outcome = commit(&node, &signed).await.unwrap();
    assert_eq!(outcome.status, 201);

    let event = tokio::time::timeout(StdDuration::from_secs(1), ev_rx.recv())
        .await
        .expect("event within a second")
        .unwrap();
    assert_eq!(event.document, signed.document);
    assert!(event.item.is_none());

    assert!(node.get_commit(&outcome.document_id).await.unwrap().is_none());
    let items = node
        .store()
        .timeline_items_before(&[timeline.clone()], Utc::now() + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert!(items.is_empty());

    // Events follow the timeline's post rules.
    let stranger = TestIdentity::new();
    commit(&node, &stranger.sign(stranger.affiliation(DOMAIN))).await.unwrap();
    let err = commit(&node, &stranger.sign(stranger.event(&timeline, "hello")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    drop(req_tx);
    tokio::time::timeout(StdDuration::from_secs(1), conn)
        .await
        .unwrap()
        .unwrap();
}
