//! Proptest strategies for identifiers, timeline items and policies.

use chrono::{DateTime, TimeZone, Utc};
use conode_core::{Cdid, ResourceKind, TimelineItem, TypedId};
use conode_policy::{Effect, Expr, Policy, Statement};
use proptest::prelude::*;

/// Milliseconds between 2020 and 2040.
pub fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800_000i64..2_208_988_800_000i64)
        .prop_map(|ms| Utc.timestamp_millis_opt(ms).single().unwrap_or_default())
}

/// The ten random bytes of a CDID.
pub fn cdid_data() -> impl Strategy<Value = [u8; 10]> {
    any::<[u8; 10]>()
}

pub fn cdid() -> impl Strategy<Value = Cdid> {
    (cdid_data(), timestamp()).prop_map(|(data, time)| Cdid::new(data, time))
}

pub fn message_id() -> impl Strategy<Value = TypedId> {
    cdid().prop_map(|c| TypedId::new(ResourceKind::Message, c))
}

/// Items spread over `timelines`, with cdates inside one hour so that
/// several fall into the same chunk and some share a millisecond.
pub fn timeline_items(
    timelines: Vec<String>,
    max: usize,
) -> impl Strategy<Value = Vec<TimelineItem>> {
    let base = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap_or_default();
    let count = timelines.len().max(1);
    prop::collection::vec(
        (0..count, 0i64..3_600_000, cdid_data(), "[a-z]{1,6}"),
        1..max,
    )
    .prop_map(move |raw| {
        raw.into_iter()
            .map(|(t, offset, data, owner)| {
                let cdate = base + chrono::Duration::milliseconds(offset - offset % 7);
                TimelineItem {
                    resource_id: TypedId::new(ResourceKind::Message, Cdid::new(data, cdate)),
                    timeline_id: timelines.get(t).cloned().unwrap_or_default(),
                    owner: format!("con1{}", owner),
                    author: None,
                    schema: "https://schema.conode.dev/note.json".into(),
                    cdate,
                }
            })
            .collect()
    })
}

/// A condition that always evaluates to `value`.
pub fn constant_condition(value: bool) -> Expr {
    Expr::new("const").with_constant(value)
}

pub fn effect() -> impl Strategy<Value = Effect> {
    prop_oneof![Just(Effect::Allow), Just(Effect::Deny)]
}

/// A statement on `action` whose condition is a constant. `None` means
/// the statement has no condition.
pub fn statement(action: &'static str) -> impl Strategy<Value = Statement> {
    (effect(), prop::option::of(any::<bool>())).prop_map(move |(effect, condition)| Statement {
        actions: vec![action.to_string()],
        effect,
        condition: condition.map(constant_condition),
        policy_defaults: None,
    })
}

pub fn policy(action: &'static str) -> impl Strategy<Value = Policy> {
    prop::collection::vec(statement(action), 0..6).prop_map(|statements| Policy {
        name: String::new(),
        version: "2024-01-01".into(),
        statements,
    })
}

/// Whether a statement takes effect under a constant condition.
pub fn applies(statement: &Statement) -> bool {
    statement
        .condition
        .as_ref()
        .map_or(true, |c| c.constant.as_bool() == Some(true))
}
