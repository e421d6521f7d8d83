//! Expression evaluation.
//!
//! Evaluation never panics and never returns `Err`: every node produces an
//! [`EvalResult`] with either a value or an error string, so a failed
//! condition can be reported back to the caller.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::model::Expr;

/// Trace of one evaluated expression node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalResult {
    pub operator: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<EvalResult>,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvalResult {
    fn ok(op: &str, args: Vec<EvalResult>, result: Value) -> Self {
        Self {
            operator: op.to_string(),
            args,
            result,
            error: None,
        }
    }

    fn fail(op: &str, args: Vec<EvalResult>, error: impl Into<String>) -> Self {
        Self {
            operator: op.to_string(),
            args,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    /// The boolean value, if evaluation succeeded with a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        if self.error.is_some() {
            return None;
        }
        self.result.as_bool()
    }

    /// First error in this subtree, depth first.
    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.args.iter().find_map(|a| a.first_error()))
    }
}

/// Evaluate `expr` against `ctx` with the merged statement parameters.
pub fn evaluate(expr: &Expr, ctx: &RequestContext, params: &Map<String, Value>) -> EvalResult {
    let op = expr.op.as_str();
    let args: Vec<EvalResult> = expr.args.iter().map(|a| evaluate(a, ctx, params)).collect();

    if let Some(failed) = args.iter().find(|a| a.error.is_some()) {
        let reason = format!("argument `{}` failed", failed.operator);
        return EvalResult::fail(op, args, reason);
    }

    match op {
        "const" => EvalResult::ok(op, args, expr.constant.clone()),

        "eq" | "ne" => match operands(&args, &expr.constant) {
            Some((lhs, rhs)) => {
                let equal = lhs == rhs;
                EvalResult::ok(op, args, Value::Bool(if op == "eq" { equal } else { !equal }))
            }
            None => EvalResult::fail(op, args, "expects two operands"),
        },

        "and" | "or" => {
            if args.is_empty() {
                return EvalResult::fail(op, args, "expects at least one argument");
            }
            let bools: Option<Vec<bool>> = args.iter().map(|a| a.result.as_bool()).collect();
            match bools {
                Some(values) => {
                    let value = if op == "and" {
                        values.iter().all(|v| *v)
                    } else {
                        values.iter().any(|v| *v)
                    };
                    EvalResult::ok(op, args, Value::Bool(value))
                }
                None => EvalResult::fail(op, args, "arguments must be boolean"),
            }
        }

        "not" => match args.as_slice() {
            [single] => match single.result.as_bool() {
                Some(b) => EvalResult::ok(op, args, Value::Bool(!b)),
                None => EvalResult::fail(op, args, "argument must be boolean"),
            },
            _ => EvalResult::fail(op, args, "expects exactly one argument"),
        },

        "in" => match operands(&args, &expr.constant) {
            Some((needle, Value::Array(haystack))) => {
                let found = haystack.contains(&needle);
                EvalResult::ok(op, args, Value::Bool(found))
            }
            Some(_) => EvalResult::fail(op, args, "second operand must be an array"),
            None => EvalResult::fail(op, args, "expects two operands"),
        },

        "isRequester" => {
            let candidate = args.first().map(|a| &a.result).unwrap_or(&expr.constant);
            let matched = match candidate {
                Value::String(s) => Some(s == &ctx.requester),
                Value::Array(list) => {
                    Some(list.iter().any(|v| v.as_str() == Some(ctx.requester.as_str())))
                }
                _ => None,
            };
            match matched {
                Some(m) => EvalResult::ok(op, args, Value::Bool(m)),
                None => EvalResult::fail(op, args, "expects a CCID or list of CCIDs"),
            }
        }

        "isSelf" => EvalResult::ok(op, args, Value::Bool(ctx.is_owner())),

        "hasTag" => {
            let Some(tag) = expr.constant.as_str() else {
                return EvalResult::fail(op, args, "expects a tag constant");
            };
            let has = ctx
                .requester_entity
                .as_ref()
                .is_some_and(|e| e.tag.split(',').any(|t| t.trim() == tag));
            EvalResult::ok(op, args, Value::Bool(has))
        }

        "getParam" => {
            let Some(key) = expr.constant.as_str() else {
                return EvalResult::fail(op, args, "expects a parameter name");
            };
            match params.get(key) {
                Some(value) => EvalResult::ok(op, args, value.clone()),
                None => EvalResult::fail(op, args, format!("parameter `{}` not set", key)),
            }
        }

        "loadSelf" => {
            let Some(path) = expr.constant.as_str() else {
                return EvalResult::fail(op, args, "expects a field path");
            };
            let Some(record) = ctx.self_.as_ref() else {
                return EvalResult::fail(op, args, "no target record");
            };
            match lookup(record, path) {
                Some(value) => EvalResult::ok(op, args, value),
                None => EvalResult::fail(op, args, format!("field `{}` not found", path)),
            }
        }

        "loadDocument" => {
            let Some(path) = expr.constant.as_str() else {
                return EvalResult::fail(op, args, "expects a field path");
            };
            match lookup(&ctx.document, path) {
                Some(value) => EvalResult::ok(op, args, value),
                None => EvalResult::fail(op, args, format!("field `{}` not found", path)),
            }
        }

        "loadRequester" => {
            let Some(name) = expr.constant.as_str() else {
                return EvalResult::fail(op, args, "expects a claim name");
            };
            match ctx.claims.get(name) {
                Some(value) => EvalResult::ok(op, args, value),
                None => EvalResult::fail(op, args, format!("claim `{}` not present", name)),
            }
        }

        "isCaptchaVerified" => EvalResult::ok(op, args, Value::Bool(ctx.claims.captcha_verified)),

        "isRequesterLocalUser" => EvalResult::ok(op, args, Value::Bool(ctx.is_local_user())),

        "isRequesterRemoteUser" => EvalResult::ok(op, args, Value::Bool(ctx.is_remote_user())),

        other => {
            let reason = format!("unknown operator `{}`", other);
            EvalResult::fail(op, args, reason)
        }
    }
}

/// Two operands from either two arguments or one argument plus the constant.
fn operands(args: &[EvalResult], constant: &Value) -> Option<(Value, Value)> {
    match args {
        [lhs, rhs] => Some((lhs.result.clone(), rhs.result.clone())),
        [lhs] if !constant.is_null() => Some((lhs.result.clone(), constant.clone())),
        _ => None,
    }
}

/// Walk a dotted path. String values holding JSON are descended into, so
/// `document.body.text` works on a record whose `document` is a string.
fn lookup(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if let Value::String(raw) = &current {
            current = serde_json::from_str(raw).ok()?;
        }
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let idx: usize = segment.parse().ok()?;
                if idx >= items.len() {
                    return None;
                }
                items.swap_remove(idx)
            }
            _ => return None,
        };
    }
    Some(current)
}
