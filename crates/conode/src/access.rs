//! Glue between records and the policy engine.

use conode_policy::Decision;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{NodeError, Result};

/// `policyParams` stored on a record, as an object.
pub(crate) fn record_params(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None | Some("") => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(NodeError::Malformed("policyParams: not an object".into())),
            Err(e) => {
                debug!(error = %e, "unreadable policyParams");
                Err(NodeError::Malformed(format!("policyParams: {}", e)))
            }
        },
    }
}

/// Turn a deny into `PermissionDenied`.
pub(crate) fn ensure_allowed(decision: &Decision, what: &str) -> Result<()> {
    if decision.is_allowed() {
        return Ok(());
    }
    if decision.errors.is_empty() {
        Err(NodeError::PermissionDenied(what.to_string()))
    } else {
        Err(NodeError::PermissionDenied(format!(
            "{} ({})",
            what,
            decision.errors.join("; ")
        )))
    }
}
