//! Identities and signed documents for tests.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use conode_core::Keypair;
use serde_json::{json, Map, Value};

/// A document and the signature to commit it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub document: String,
    pub signature: String,
}

/// An entity with its root key and, optionally, subkeys.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    pub keypair: Keypair,
    pub ccid: String,
}

impl TestIdentity {
    /// Create an identity with a random root key.
    pub fn new() -> Self {
        Self::from_keypair(Keypair::generate())
    }

    /// Create an identity with a deterministic root key.
    pub fn with_seed(seed: u8) -> Self {
        let mut bytes = [0u8; 32];
        bytes[31] = seed.max(1);
        bytes[0] = 0x42;
        Self::from_keypair(Keypair::from_seed(&bytes).expect("seed is a valid scalar"))
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let ccid = keypair.ccid();
        Self { keypair, ccid }
    }

    /// A fresh keypair to enact as a subkey of this identity.
    pub fn subkey(&self) -> SubKey {
        let keypair = Keypair::generate();
        SubKey {
            ckid: keypair.ckid(),
            keypair,
        }
    }

    /// Start a document of the given type signed by this identity.
    pub fn document(&self, kind: &str) -> DocumentBuilder {
        DocumentBuilder::new(&self.ccid, kind)
    }

    pub fn affiliation(&self, domain: &str) -> DocumentBuilder {
        self.document("affiliation").field("domain", domain)
    }

    pub fn tombstone(&self) -> DocumentBuilder {
        self.document("tombstone").field("reason", "leaving")
    }

    pub fn message(&self, body: impl Into<Value>, timelines: &[&str]) -> DocumentBuilder {
        self.document("message")
            .field("schema", "https://schema.conode.dev/note.json")
            .field("body", body)
            .field("timelines", json!(timelines))
    }

    pub fn timeline(&self, semantic_id: &str) -> DocumentBuilder {
        self.document("timeline")
            .field("schema", "https://schema.conode.dev/timeline.json")
            .field("body", json!({ "name": semantic_id }))
            .semantic_id(semantic_id)
    }

    pub fn profile(&self, semantic_id: &str, body: impl Into<Value>) -> DocumentBuilder {
        self.document("profile")
            .field("schema", "https://schema.conode.dev/profile.json")
            .field("body", body)
            .semantic_id(semantic_id)
    }

    pub fn subscription(&self, semantic_id: &str) -> DocumentBuilder {
        self.document("subscription")
            .field("schema", "https://schema.conode.dev/subscription.json")
            .field("body", json!({ "name": semantic_id }))
            .semantic_id(semantic_id)
    }

    pub fn subscribe(&self, subscription: &str, target: &str) -> DocumentBuilder {
        self.document("subscribe")
            .field("subscription", subscription)
            .field("target", target)
    }

    pub fn unsubscribe(&self, subscription: &str, target: &str) -> DocumentBuilder {
        self.document("unsubscribe")
            .field("subscription", subscription)
            .field("target", target)
    }

    pub fn association(
        &self,
        target: &str,
        owner: &str,
        body: impl Into<Value>,
        timelines: &[&str],
    ) -> DocumentBuilder {
        self.document("association")
            .field("schema", "https://schema.conode.dev/like.json")
            .field("body", body)
            .field("target", target)
            .field("owner", owner)
            .field("variant", "")
            .field("timelines", json!(timelines))
    }

    pub fn ack(&self, to: &str) -> DocumentBuilder {
        self.document("ack").field("from", self.ccid.as_str()).field("to", to)
    }

    /// Enact `subkey` directly under the root key.
    pub fn enact(&self, subkey: &str) -> DocumentBuilder {
        self.enact_under(subkey, &self.ccid)
    }

    /// Enact `subkey` under `parent`, which signs the document.
    pub fn enact_under(&self, subkey: &str, parent: &str) -> DocumentBuilder {
        self.document("enact")
            .field("target", subkey)
            .field("root", self.ccid.as_str())
            .field("parent", parent)
    }

    pub fn revoke(&self, subkey: &str) -> DocumentBuilder {
        self.document("revoke").field("target", subkey)
    }

    pub fn delete(&self, target: &str) -> DocumentBuilder {
        self.document("delete").field("target", target)
    }

    pub fn retract(&self, timeline: &str, target: &str) -> DocumentBuilder {
        self.document("retract")
            .field("timeline", timeline)
            .field("target", target)
    }

    pub fn event(&self, timeline: &str, body: impl Into<Value>) -> DocumentBuilder {
        self.document("event")
            .field("timeline", timeline)
            .field("body", body)
    }

    /// Sign with the root key.
    pub fn sign(&self, builder: DocumentBuilder) -> SignedDocument {
        builder.sign_with(&self.keypair)
    }
}

impl Default for TestIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// A delegated key. Documents it signs carry its `keyID`.
#[derive(Debug, Clone)]
pub struct SubKey {
    pub keypair: Keypair,
    pub ckid: String,
}

impl SubKey {
    pub fn sign(&self, builder: DocumentBuilder) -> SignedDocument {
        builder.key_id(&self.ckid).sign_with(&self.keypair)
    }
}

/// Builds the JSON text of a document field by field.
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    fields: Map<String, Value>,
}

impl DocumentBuilder {
    pub fn new(signer: &str, kind: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("signer".into(), signer.into());
        fields.insert("type".into(), kind.into());
        let builder = Self { fields };
        builder.signed_at(Utc::now())
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn signed_at(self, at: DateTime<Utc>) -> Self {
        self.field("signedAt", at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Shift `signedAt` relative to now.
    pub fn signed_after(self, offset: Duration) -> Self {
        self.signed_at(Utc::now() + offset)
    }

    pub fn key_id(self, key_id: &str) -> Self {
        self.field("keyID", key_id)
    }

    pub fn semantic_id(self, semantic_id: &str) -> Self {
        self.field("semanticID", semantic_id)
    }

    pub fn policy(self, policy: impl Into<String>) -> Self {
        self.field("policy", policy.into())
    }

    pub fn policy_params(self, params: Value) -> Self {
        self.field("policyParams", params.to_string())
    }

    /// The JSON text, without signing it.
    pub fn build(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    /// Sign `keccak256(document)` and hex-encode the 65-byte signature.
    pub fn sign_with(self, keypair: &Keypair) -> SignedDocument {
        let document = self.build();
        let signature = keypair
            .sign(document.as_bytes())
            .expect("signing with a valid key")
            .to_hex();
        SignedDocument {
            document,
            signature,
        }
    }
}

/// Distinct identities for multi-party tests.
pub fn identities(count: usize) -> Vec<TestIdentity> {
    (1..=count).map(|i| TestIdentity::with_seed(i as u8)).collect()
}

/// The policy that only lets `owner` post, as an inline JSON string.
pub fn owner_only_post_policy(owner: &str) -> String {
    json!({
        "statements": [{
            "actions": ["post"],
            "effect": "deny",
            "condition": {
                "op": "not",
                "args": [{ "op": "isRequester", "constant": owner }]
            }
        }]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conode_core::{is_ccid, is_ckid, verify_document, Document};

    #[test]
    fn seeded_identities_are_stable() {
        let a = TestIdentity::with_seed(7);
        let b = TestIdentity::with_seed(7);
        assert_eq!(a.ccid, b.ccid);
        assert!(is_ccid(&a.ccid));
        assert_ne!(a.ccid, TestIdentity::with_seed(8).ccid);
    }

    #[test]
    fn signed_documents_verify_against_signer() {
        let alice = TestIdentity::new();
        let signed = alice.sign(alice.message("hello", &["t0"]));
        verify_document(&signed.document, &signed.signature, &alice.ccid).unwrap();

        let doc = Document::parse(&signed.document).unwrap();
        assert_eq!(doc.signer(), alice.ccid);
        assert!(doc.key_id().is_none());
    }

    #[test]
    fn subkey_documents_carry_key_id() {
        let alice = TestIdentity::new();
        let sub = alice.subkey();
        assert!(is_ckid(&sub.ckid));

        let signed = sub.sign(alice.message("via subkey", &["t0"]));
        let doc = Document::parse(&signed.document).unwrap();
        assert_eq!(doc.key_id(), Some(sub.ckid.as_str()));
        verify_document(&signed.document, &signed.signature, &sub.ckid).unwrap();
    }

    #[test]
    fn identities_are_distinct() {
        let ids = identities(4);
        let mut ccids: Vec<_> = ids.iter().map(|i| i.ccid.clone()).collect();
        ccids.dedup();
        assert_eq!(ccids.len(), 4);
    }
}
