//! Policy resolution and the allow/deny decision.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::context::RequestContext;
use crate::error::{PolicyError, Result};
use crate::eval::{evaluate, EvalResult};
use crate::model::{Action, Effect, Policy, PolicyTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

/// One matching statement and how its condition evaluated.
#[derive(Debug, Clone, Serialize)]
pub struct StatementTrace {
    pub policy: String,
    pub effect: Effect,
    /// `None` when the statement has no condition.
    pub condition: Option<EvalResult>,
    /// Whether the statement took effect.
    pub applied: bool,
}

/// Outcome of evaluating the policies guarding one action.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Decided by the built-in default table rather than a statement.
    pub defaulted: bool,
    pub traces: Vec<StatementTrace>,
    /// Resolution and evaluation errors, for diagnostics.
    pub errors: Vec<String>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Resolves policy references and decides requests.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    registry: HashMap<String, Policy>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(registry: HashMap<String, Policy>) -> Self {
        Self { registry }
    }

    pub fn register(&mut self, name: impl Into<String>, policy: Policy) {
        self.registry.insert(name.into(), policy);
    }

    /// Inline policies start with `{`; anything else is a registered name.
    pub fn resolve(&self, reference: &str) -> Result<Policy> {
        let trimmed = reference.trim_start();
        if trimmed.starts_with('{') {
            return Policy::from_json(trimmed);
        }
        self.registry
            .get(reference)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownPolicy(reference.to_string()))
    }

    /// Decide `action` on a `target` record guarded by `policies`.
    ///
    /// Any applied deny wins, then any applied allow; otherwise the default
    /// table decides. Statements whose condition errors count as neither.
    pub fn decide(
        &self,
        target: PolicyTarget,
        action: Action,
        policies: &[&str],
        ctx: &RequestContext,
    ) -> Decision {
        let mut traces = Vec::new();
        let mut errors = Vec::new();

        for reference in policies.iter().filter(|p| !p.is_empty()) {
            match self.resolve(reference) {
                Ok(policy) => {
                    let name = if policy.name.is_empty() {
                        String::from("inline")
                    } else {
                        policy.name.clone()
                    };
                    for trace in statement_traces(&policy, &name, action, ctx) {
                        if let Some(err) = trace.condition.as_ref().and_then(|c| c.first_error()) {
                            errors.push(format!("{}: {}", name, err));
                        }
                        traces.push(trace);
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        let applied = |effect: Effect| traces.iter().any(|t| t.applied && t.effect == effect);
        let (verdict, defaulted) = if applied(Effect::Deny) {
            (Verdict::Deny, false)
        } else if applied(Effect::Allow) {
            (Verdict::Allow, false)
        } else {
            (default_verdict(target, action, ctx), true)
        };

        if verdict == Verdict::Deny {
            debug!(
                target_kind = %target,
                action = %action,
                requester = %ctx.requester,
                defaulted,
                "policy denied"
            );
        }

        Decision {
            verdict,
            defaulted,
            traces,
            errors,
        }
    }
}

fn statement_traces(
    policy: &Policy,
    name: &str,
    action: Action,
    ctx: &RequestContext,
) -> Vec<StatementTrace> {
    policy
        .statements_for(action)
        .map(|statement| {
            let params = ctx.merged_params(statement.policy_defaults.as_ref());
            let condition = statement
                .condition
                .as_ref()
                .map(|expr| evaluate(expr, ctx, &params));
            let applied = match &condition {
                None => true,
                Some(result) => result.as_bool() == Some(true),
            };
            StatementTrace {
                policy: name.to_string(),
                effect: statement.effect,
                condition,
                applied,
            }
        })
        .collect()
}

/// Built-in decision when no statement applies.
pub fn default_verdict(target: PolicyTarget, action: Action, ctx: &RequestContext) -> Verdict {
    use Action::*;
    use PolicyTarget::*;

    let allowed = match (target, action) {
        (Timeline, Read) => true,
        (Timeline, Post | Event) => ctx.is_owner() || ctx.domain_owned,
        (Timeline | Profile | Subscription, Update | Delete) => ctx.is_owner(),
        (Subscription, Subscribe) => ctx.is_owner(),
        (Message | Profile | Subscription, Read) => true,
        (Message, Associate) => true,
        (Message, Delete) => ctx.is_owner(),
        (Association, Delete) => ctx.is_owner() || ctx.is_target_owner(),
        (Entity, Register) => ctx.registration_open,
        _ => false,
    };

    if allowed {
        Verdict::Allow
    } else {
        Verdict::Deny
    }
}
