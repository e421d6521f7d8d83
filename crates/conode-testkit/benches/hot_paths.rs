use std::collections::HashMap;

use chrono::Utc;
use conode_core::{Cdid, Document};
use conode_policy::{Action, Policy, PolicyEngine, PolicyTarget, RequestContext};
use conode_testkit::{owner_only_post_policy, TestIdentity};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn cdid_minting(c: &mut Criterion) {
    let content = br#"{"signer":"con1x","type":"message","signedAt":"2024-01-01T00:00:00.000Z"}"#;
    let now = Utc::now();

    c.bench_function("cdid_make_at", |b| b.iter(|| Cdid::make_at(black_box(now))));
    c.bench_function("cdid_from_content", |b| {
        b.iter(|| Cdid::from_content(black_box(content), now))
    });
    c.bench_function("cdid_to_base32", |b| {
        let id = Cdid::make_at(now);
        b.iter(|| black_box(id).to_base32())
    });
}

fn policy_evaluation(c: &mut Criterion) {
    let owner = TestIdentity::with_seed(1);
    let inline = owner_only_post_policy(&owner.ccid);

    let mut registry = HashMap::new();
    if let Ok(policy) = Policy::from_json(&inline) {
        registry.insert("owner-only".to_string(), policy);
    }
    let engine = PolicyEngine::with_policies(registry);
    let ctx = RequestContext::new(owner.ccid.clone(), "example.com");

    c.bench_function("decide_inline", |b| {
        b.iter(|| {
            engine.decide(
                PolicyTarget::Timeline,
                Action::Post,
                black_box(&[inline.as_str()]),
                &ctx,
            )
        })
    });
    c.bench_function("decide_registered", |b| {
        b.iter(|| {
            engine.decide(PolicyTarget::Timeline, Action::Post, black_box(&["owner-only"]), &ctx)
        })
    });
    let none: &[&str] = &[];
    c.bench_function("decide_default", |b| {
        b.iter(|| engine.decide(PolicyTarget::Timeline, Action::Read, black_box(none), &ctx))
    });
}

fn document_signing(c: &mut Criterion) {
    let alice = TestIdentity::with_seed(2);

    c.bench_function("sign_message", |b| {
        b.iter(|| alice.sign(alice.message(black_box("hello"), &["t0"])))
    });
    let signed = alice.sign(alice.message("hello", &["t0"]));
    c.bench_function("parse_message", |b| {
        b.iter(|| Document::parse(black_box(&signed.document)))
    });
}

criterion_group!(benches, cdid_minting, policy_evaluation, document_signing);
criterion_main!(benches);
