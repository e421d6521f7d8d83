//! # conode policy
//!
//! A small declarative policy language guarding commits and reads.
//!
//! A [`Policy`] holds [`Statement`]s; each covers a set of [`Action`]s with an
//! [`Effect`] and a condition [`Expr`]. [`PolicyEngine::decide`] evaluates
//! every statement matching the action:
//!
//! 1. any applied `deny` denies
//! 2. otherwise any applied `allow` allows
//! 3. otherwise the built-in [`default_verdict`] table decides
//!
//! A condition that fails to evaluate counts as neither allow nor deny. Its
//! error is kept in the [`Decision`] for diagnostics.
//!
//! ```rust
//! use conode_policy::{Action, PolicyEngine, PolicyTarget, RequestContext};
//!
//! let engine = PolicyEngine::new();
//! let ctx = RequestContext::new("con1reader", "example.com");
//! let decision = engine.decide(PolicyTarget::Timeline, Action::Read, &[], &ctx);
//! assert!(decision.is_allowed());
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod model;

pub use context::{RequestContext, RequesterClaims};
pub use engine::{default_verdict, Decision, PolicyEngine, StatementTrace, Verdict};
pub use error::{PolicyError, Result};
pub use eval::{evaluate, EvalResult};
pub use model::{Action, Effect, Expr, Policy, PolicyTarget, Statement};
