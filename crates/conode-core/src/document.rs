//! Signed document envelopes.
//!
//! Every commit carries a JSON document whose `type` field selects one of the
//! concrete shapes below. The common fields live in [`DocumentBase`], which
//! each concrete document flattens in.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cdid::TypedId;
use crate::error::CoreError;

/// The `type` discriminator of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Message,
    Association,
    Profile,
    Timeline,
    Subscription,
    Subscribe,
    Unsubscribe,
    Ack,
    Unack,
    Enact,
    Revoke,
    Delete,
    Event,
    Affiliation,
    Tombstone,
    Retract,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 16] = [
        Self::Message,
        Self::Association,
        Self::Profile,
        Self::Timeline,
        Self::Subscription,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Ack,
        Self::Unack,
        Self::Enact,
        Self::Revoke,
        Self::Delete,
        Self::Event,
        Self::Affiliation,
        Self::Tombstone,
        Self::Retract,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Association => "association",
            Self::Profile => "profile",
            Self::Timeline => "timeline",
            Self::Subscription => "subscription",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ack => "ack",
            Self::Unack => "unack",
            Self::Enact => "enact",
            Self::Revoke => "revoke",
            Self::Delete => "delete",
            Self::Event => "event",
            Self::Affiliation => "affiliation",
            Self::Tombstone => "tombstone",
            Self::Retract => "retract",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Ephemeral commits are delivered but never persisted as records.
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Event)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBase {
    pub signer: String,

    #[serde(rename = "type")]
    pub kind: DocumentKind,

    #[serde(rename = "keyID", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(rename = "semanticID", default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<String>,

    #[serde(rename = "signedAt")]
    pub signed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    /// Opaque JSON object encoded as a string.
    #[serde(rename = "policyParams", default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub schema: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub timelines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub schema: String,
    #[serde(default)]
    pub body: Value,
    pub target: TypedId,
    /// CCID of the target's owner.
    pub owner: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub timelines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub schema: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub schema: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub indexable: bool,
    #[serde(rename = "domainOwned", default)]
    pub domain_owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub schema: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub indexable: bool,
    #[serde(rename = "domainOwned", default)]
    pub domain_owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub subscription: String,
    /// Timeline being added to or removed from the subscription.
    pub target: String,
}

/// `ack` and `unack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnactDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    /// The subkey being enacted.
    pub target: String,
    pub root: String,
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub target: TypedId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetractDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub timeline: String,
    pub target: TypedId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub timeline: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliationDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TombstoneDocument {
    #[serde(flatten)]
    pub base: DocumentBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A decoded document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Message(MessageDocument),
    Association(AssociationDocument),
    Profile(ProfileDocument),
    Timeline(TimelineDocument),
    Subscription(SubscriptionDocument),
    Subscribe(SubscribeDocument),
    Unsubscribe(SubscribeDocument),
    Ack(AckDocument),
    Unack(AckDocument),
    Enact(EnactDocument),
    Revoke(RevokeDocument),
    Delete(DeleteDocument),
    Event(EventDocument),
    Affiliation(AffiliationDocument),
    Tombstone(TombstoneDocument),
    Retract(RetractDocument),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<Value>,
    signer: Option<Value>,
}

fn decode_as<T: DeserializeOwned>(raw: &str) -> Result<T, CoreError> {
    let de = &mut serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize(de).map_err(|err| {
        let path = err.path().to_string();
        CoreError::Malformed(format!("{}: {}", path, err.into_inner()))
    })
}

impl Document {
    /// Parse a raw document string, selecting the shape by `type`.
    ///
    /// Errors name the JSON path that failed.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let envelope: Envelope = decode_as(raw)?;

        let kind = match envelope.kind {
            None | Some(Value::Null) => return Err(CoreError::Malformed("type: missing".into())),
            Some(Value::String(name)) => {
                DocumentKind::from_name(&name).ok_or(CoreError::UnknownType(name))?
            }
            Some(other) => return Err(CoreError::UnknownType(other.to_string())),
        };
        match envelope.signer {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => return Err(CoreError::Malformed("signer: missing".into())),
        }

        let doc = match kind {
            DocumentKind::Message => Self::Message(decode_as(raw)?),
            DocumentKind::Association => Self::Association(decode_as(raw)?),
            DocumentKind::Profile => Self::Profile(decode_as(raw)?),
            DocumentKind::Timeline => Self::Timeline(decode_as(raw)?),
            DocumentKind::Subscription => Self::Subscription(decode_as(raw)?),
            DocumentKind::Subscribe => Self::Subscribe(decode_as(raw)?),
            DocumentKind::Unsubscribe => Self::Unsubscribe(decode_as(raw)?),
            DocumentKind::Ack => Self::Ack(decode_as(raw)?),
            DocumentKind::Unack => Self::Unack(decode_as(raw)?),
            DocumentKind::Enact => Self::Enact(decode_as(raw)?),
            DocumentKind::Revoke => Self::Revoke(decode_as(raw)?),
            DocumentKind::Delete => Self::Delete(decode_as(raw)?),
            DocumentKind::Event => Self::Event(decode_as(raw)?),
            DocumentKind::Affiliation => Self::Affiliation(decode_as(raw)?),
            DocumentKind::Tombstone => Self::Tombstone(decode_as(raw)?),
            DocumentKind::Retract => Self::Retract(decode_as(raw)?),
        };
        Ok(doc)
    }

    /// Parse and check the envelope against the clock.
    pub fn decode(
        raw: &str,
        now: DateTime<Utc>,
        skew: chrono::Duration,
    ) -> Result<Self, CoreError> {
        let doc = Self::parse(raw)?;
        crate::validation::validate_envelope(&doc, now, skew)?;
        Ok(doc)
    }

    pub fn base(&self) -> &DocumentBase {
        match self {
            Self::Message(d) => &d.base,
            Self::Association(d) => &d.base,
            Self::Profile(d) => &d.base,
            Self::Timeline(d) => &d.base,
            Self::Subscription(d) => &d.base,
            Self::Subscribe(d) | Self::Unsubscribe(d) => &d.base,
            Self::Ack(d) | Self::Unack(d) => &d.base,
            Self::Enact(d) => &d.base,
            Self::Revoke(d) => &d.base,
            Self::Delete(d) => &d.base,
            Self::Event(d) => &d.base,
            Self::Affiliation(d) => &d.base,
            Self::Tombstone(d) => &d.base,
            Self::Retract(d) => &d.base,
        }
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            Self::Message(_) => DocumentKind::Message,
            Self::Association(_) => DocumentKind::Association,
            Self::Profile(_) => DocumentKind::Profile,
            Self::Timeline(_) => DocumentKind::Timeline,
            Self::Subscription(_) => DocumentKind::Subscription,
            Self::Subscribe(_) => DocumentKind::Subscribe,
            Self::Unsubscribe(_) => DocumentKind::Unsubscribe,
            Self::Ack(_) => DocumentKind::Ack,
            Self::Unack(_) => DocumentKind::Unack,
            Self::Enact(_) => DocumentKind::Enact,
            Self::Revoke(_) => DocumentKind::Revoke,
            Self::Delete(_) => DocumentKind::Delete,
            Self::Event(_) => DocumentKind::Event,
            Self::Affiliation(_) => DocumentKind::Affiliation,
            Self::Tombstone(_) => DocumentKind::Tombstone,
            Self::Retract(_) => DocumentKind::Retract,
        }
    }

    pub fn signer(&self) -> &str {
        &self.base().signer
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.base().signed_at
    }

    pub fn key_id(&self) -> Option<&str> {
        self.base().key_id.as_deref()
    }

    /// The explicit `id` carried by mutable record documents.
    pub fn explicit_id(&self) -> Option<&str> {
        match self {
            Self::Profile(d) => d.id.as_deref(),
            Self::Timeline(d) => d.id.as_deref(),
            Self::Subscription(d) => d.id.as_deref(),
            _ => None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.kind().is_ephemeral()
    }

    /// Merged `policyParams` as a JSON object, if present and well-formed.
    pub fn policy_params(&self) -> Result<Option<serde_json::Map<String, Value>>, CoreError> {
        match &self.base().policy_params {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| CoreError::Malformed(format!("policyParams: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER: &str = "con1dxp8n8ctve3wq9gws3a92exj9p4nld2h6r838v";

    fn message_json() -> String {
        serde_json::json!({
            "signer": SIGNER,
            "type": "message",
            "schema": "https://schema.example/note.json",
            "body": {"text": "hello"},
            "timelines": ["t0"],
            "signedAt": "2024-01-01T00:00:00Z"
        })
        .to_string()
    }

    #[test]
    fn test_parse_message() {
        let doc = Document::parse(&message_json()).unwrap();
        assert_eq!(doc.kind(), DocumentKind::Message);
        assert_eq!(doc.signer(), SIGNER);
        match doc {
            Document::Message(m) => {
                assert_eq!(m.timelines, vec!["t0".to_string()]);
                assert_eq!(m.body["text"], "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_type() {
        let raw = serde_json::json!({"signer": SIGNER, "signedAt": "2024-01-01T00:00:00Z"});
        let err = Document::parse(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_unknown_type() {
        let raw = serde_json::json!({
            "signer": SIGNER,
            "type": "poke",
            "signedAt": "2024-01-01T00:00:00Z"
        });
        assert!(matches!(
            Document::parse(&raw.to_string()),
            Err(CoreError::UnknownType(name)) if name == "poke"
        ));
    }

    #[test]
    fn test_missing_signer() {
        let raw = serde_json::json!({
            "type": "message",
            "schema": "s",
            "signedAt": "2024-01-01T00:00:00Z"
        });
        let err = Document::parse(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("signer"));
    }

    #[test]
    fn test_error_names_path() {
        let raw = serde_json::json!({
            "signer": SIGNER,
            "type": "message",
            "schema": "s",
            "timelines": [1],
            "signedAt": "2024-01-01T00:00:00Z"
        });
        let err = Document::parse(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("timelines"), "{}", err);
    }

    #[test]
    fn test_typed_target() {
        let raw = serde_json::json!({
            "signer": SIGNER,
            "type": "delete",
            "target": "not-an-id",
            "signedAt": "2024-01-01T00:00:00Z"
        });
        assert!(Document::parse(&raw.to_string()).is_err());
    }

    #[test]
    fn test_policy_params() {
        let raw = serde_json::json!({
            "signer": SIGNER,
            "type": "timeline",
            "schema": "s",
            "policy": "{}",
            "policyParams": "{\"writers\":[\"a\"]}",
            "signedAt": "2024-01-01T00:00:00Z"
        });
        let doc = Document::parse(&raw.to_string()).unwrap();
        let params = doc.policy_params().unwrap().unwrap();
        assert_eq!(params["writers"][0], "a");
    }

    #[test]
    fn test_event_is_ephemeral() {
        assert!(DocumentKind::Event.is_ephemeral());
        assert!(!DocumentKind::Message.is_ephemeral());
        for kind in DocumentKind::ALL {
            assert_eq!(DocumentKind::from_name(kind.as_str()), Some(kind));
        }
    }
}
