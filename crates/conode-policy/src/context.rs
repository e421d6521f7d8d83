//! The request context a policy is evaluated against.

use conode_core::Entity;
use serde_json::{Map, Value};

/// Identity claims the authentication layer attaches to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequesterClaims {
    /// `cc-requester-type`.
    pub requester_type: Option<String>,
    /// `cc-requester-context`.
    pub requester_context: Option<String>,
    /// `cc-requester-keychain`: the key chain the requester authenticated with.
    pub requester_keychain: Option<String>,
    pub passport: Option<String>,
    /// `cc-captcha-verified`, set only after the captcha was checked upstream.
    pub captcha_verified: bool,
}

impl RequesterClaims {
    /// A claim by its policy name, or `None` when it is absent.
    pub fn get(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.clone().map(Value::String);
        match name {
            "type" => text(&self.requester_type),
            "context" => text(&self.requester_context),
            "keychain" => text(&self.requester_keychain),
            "passport" => text(&self.passport),
            "captchaVerified" => Some(Value::Bool(self.captcha_verified)),
            _ => None,
        }
    }
}

/// Who is asking, about what.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// CCID of the requester.
    pub requester: String,
    /// The requester's entity record, when known.
    pub requester_entity: Option<Entity>,
    /// JSON of the record the request targets.
    pub self_: Option<Value>,
    /// Owner of the targeted record.
    pub resource_owner: Option<String>,
    /// Owner of the record the target points at (association targets).
    pub target_owner: Option<String>,
    /// Whether the targeted timeline is domain-owned.
    pub domain_owned: bool,
    /// JSON of the document being committed.
    pub document: Value,
    /// `policyParams` of the record carrying the policy.
    pub params: Map<String, Value>,
    pub local_domain: String,
    pub registration_open: bool,
    pub claims: RequesterClaims,
}

impl RequestContext {
    pub fn new(requester: impl Into<String>, local_domain: impl Into<String>) -> Self {
        Self {
            requester: requester.into(),
            local_domain: local_domain.into(),
            ..Self::default()
        }
    }

    pub fn with_entity(mut self, entity: Option<Entity>) -> Self {
        self.requester_entity = entity;
        self
    }

    pub fn with_self(mut self, record: Value, owner: Option<String>) -> Self {
        self.self_ = Some(record);
        self.resource_owner = owner;
        self
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.document = document;
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_claims(mut self, claims: RequesterClaims) -> Self {
        self.claims = claims;
        self
    }

    pub fn is_owner(&self) -> bool {
        self.resource_owner.as_deref() == Some(self.requester.as_str())
    }

    pub fn is_target_owner(&self) -> bool {
        self.target_owner.as_deref() == Some(self.requester.as_str())
    }

    pub fn is_local_user(&self) -> bool {
        self.requester_entity
            .as_ref()
            .is_some_and(|e| e.domain == self.local_domain)
    }

    pub fn is_remote_user(&self) -> bool {
        self.requester_entity
            .as_ref()
            .is_some_and(|e| e.domain != self.local_domain)
    }

    /// `params` with `defaults` filled in underneath.
    pub fn merged_params(&self, defaults: Option<&Map<String, Value>>) -> Map<String, Value> {
        let mut merged = defaults.cloned().unwrap_or_default();
        for (k, v) in &self.params {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_underlay() {
        let mut params = Map::new();
        params.insert("writers".into(), json!(["a"]));
        let ctx = RequestContext::new("con1x", "example.com").with_params(params);

        let mut defaults = Map::new();
        defaults.insert("writers".into(), json!([]));
        defaults.insert("limit".into(), json!(5));

        let merged = ctx.merged_params(Some(&defaults));
        assert_eq!(merged["writers"], json!(["a"]));
        assert_eq!(merged["limit"], json!(5));
    }

    #[test]
    fn test_claims_by_name() {
        let claims = RequesterClaims {
            requester_type: Some("1".into()),
            captcha_verified: true,
            ..RequesterClaims::default()
        };
        assert_eq!(claims.get("type"), Some(json!("1")));
        assert_eq!(claims.get("captchaVerified"), Some(json!(true)));
        assert_eq!(claims.get("passport"), None);
        assert_eq!(claims.get("unknown"), None);
    }
}
