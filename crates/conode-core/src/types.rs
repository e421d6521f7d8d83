//! Records derived from accepted commits.
//!
//! Every record keeps the signed document and signature that produced it, so
//! any row can be re-verified or re-forwarded.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cdid::{Cdid, TypedId};
use crate::document::DocumentKind;
use crate::error::CoreError;

/// A registered user on some domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub ccid: String,
    pub domain: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub score: i64,
    pub affiliation_document: String,
    pub affiliation_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
}

impl Entity {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstone_document.is_some()
    }
}

/// A delegated subkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub id: String,
    pub root: String,
    pub parent: String,
    pub enact_document: String,
    pub enact_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_signature: Option<String>,
    pub valid_since: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// `signedAt` of the revoke document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Key {
    /// Enacted at or before `t`, not expired and not revoked at `t`.
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.valid_since <= t
            && t < self.valid_until
            && self.revoked_at.map_or(true, |revoked| t < revoked)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: TypedId,
    pub author: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
    pub document: String,
    pub signature: String,
    #[serde(default)]
    pub timelines: Vec<String>,
    pub cdate: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub id: TypedId,
    pub author: String,
    pub owner: String,
    pub schema: String,
    pub target: TypedId,
    pub variant: String,
    pub unique: String,
    pub document: String,
    pub signature: String,
    #[serde(default)]
    pub timelines: Vec<String>,
    pub cdate: DateTime<Utc>,
}

impl Association {
    pub fn key(&self) -> AssociationKey {
        AssociationKey {
            author: self.author.clone(),
            target: self.target,
            schema: self.schema.clone(),
            variant: self.variant.clone(),
            unique: self.unique.clone(),
        }
    }
}

/// The tuple at most one association row may carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssociationKey {
    pub author: String,
    pub target: TypedId,
    pub schema: String,
    pub variant: String,
    pub unique: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: TypedId,
    pub author: String,
    pub schema: String,
    #[serde(rename = "semanticID", default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub id: TypedId,
    /// Owner: the author, or the domain entity for domain-owned timelines.
    pub author: String,
    pub schema: String,
    #[serde(rename = "semanticID", default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<String>,
    pub indexable: bool,
    pub domain_owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: TypedId,
    pub author: String,
    pub schema: String,
    #[serde(rename = "semanticID", default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<String>,
    pub indexable: bool,
    pub domain_owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_params: Option<String>,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
    pub mdate: DateTime<Utc>,
}

/// A resource placed on a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    #[serde(rename = "resourceID")]
    pub resource_id: TypedId,
    #[serde(rename = "timelineID")]
    pub timeline_id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "schemaID")]
    pub schema: String,
    pub cdate: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverType {
    Entity,
    Domain,
}

impl ResolverType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Domain => "domain",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "entity" => Some(Self::Entity),
            "domain" => Some(Self::Domain),
            _ => None,
        }
    }
}

/// One timeline inside a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionItem {
    /// The subscribed timeline.
    pub id: String,
    pub subscription: String,
    pub resolver: ResolverType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Domain of the subscriber, when it differs from the timeline's host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub from: String,
    pub to: String,
    pub document: String,
    pub signature: String,
    pub cdate: DateTime<Utc>,
}

/// The authoritative transcript entry for an accepted commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLog {
    /// Surrogate key, assigned by the store.
    pub id: i64,
    #[serde(rename = "documentID")]
    pub document_id: Cdid,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub document: String,
    pub signature: String,
    pub signed_at: DateTime<Utc>,
    pub owners: Vec<String>,
    pub is_ephemeral: bool,
    /// JSON of the record returned when the commit was first accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub cdate: DateTime<Utc>,
}

/// The items of one timeline inside one ten-minute window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub key: String,
    pub items: Vec<TimelineItem>,
}

/// What the realtime hub and peers receive for a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<TimelineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    pub document: String,
    pub signature: String,
}

/// How far a commit is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommitMode {
    #[default]
    #[serde(rename = "execute")]
    Execute,
    #[serde(rename = "dryRun")]
    DryRun,
    #[serde(rename = "localOnlyExec")]
    LocalOnlyExec,
}

impl CommitMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::DryRun => "dryRun",
            Self::LocalOnlyExec => "localOnlyExec",
        }
    }

    pub const fn writes(self) -> bool {
        !matches!(self, Self::DryRun)
    }

    pub const fn forwards(self) -> bool {
        matches!(self, Self::Execute)
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "execute" => Ok(Self::Execute),
            "dryRun" => Ok(Self::DryRun),
            "localOnlyExec" => Ok(Self::LocalOnlyExec),
            other => Err(CoreError::Malformed(format!("option: unknown commit mode `{}`", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(valid_since: DateTime<Utc>, revoked_at: Option<DateTime<Utc>>) -> Key {
        Key {
            id: "cck1".into(),
            root: "con1".into(),
            parent: "con1".into(),
            enact_document: "{}".into(),
            enact_signature: String::new(),
            revoke_document: None,
            revoke_signature: None,
            valid_since,
            valid_until: valid_since + Duration::days(365),
            revoked_at,
        }
    }

    #[test]
    fn test_key_activity_window() {
        let t0 = Utc::now();
        let k = key(t0, Some(t0 + Duration::hours(1)));
        assert!(!k.is_active_at(t0 - Duration::seconds(1)));
        assert!(k.is_active_at(t0));
        assert!(k.is_active_at(t0 + Duration::minutes(59)));
        assert!(!k.is_active_at(t0 + Duration::hours(1)));
        assert!(key(t0, None).is_active_at(t0 + Duration::days(10)));
    }

    #[test]
    fn test_commit_mode_parse() {
        assert_eq!("".parse::<CommitMode>().unwrap(), CommitMode::Execute);
        assert_eq!("dryRun".parse::<CommitMode>().unwrap(), CommitMode::DryRun);
        assert_eq!(
            "localOnlyExec".parse::<CommitMode>().unwrap(),
            CommitMode::LocalOnlyExec
        );
        assert!("later".parse::<CommitMode>().is_err());
        assert!(!CommitMode::DryRun.writes());
        assert!(!CommitMode::LocalOnlyExec.forwards());
    }

    #[test]
    fn test_resolver_names() {
        assert_eq!(ResolverType::from_name("entity"), Some(ResolverType::Entity));
        assert_eq!(ResolverType::Domain.as_str(), "domain");
        assert_eq!(ResolverType::from_name("peer"), None);
    }
}
