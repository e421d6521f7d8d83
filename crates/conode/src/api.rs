//! Wire envelopes shared with the transport shell.

use std::collections::BTreeMap;

use conode_core::{Chunk, TimelineItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, Result};
use crate::node::CommitOutcome;

/// Header names carrying identity from the auth middleware.
pub mod headers {
    pub const REQUESTER_TYPE: &str = "cc-requester-type";
    pub const REQUESTER_CONTEXT: &str = "cc-requester-context";
    pub const REQUESTER_KEYCHAIN: &str = "cc-requester-keychain";
    pub const PASSPORT: &str = "passport";
    pub const CAPTCHA_VERIFIED: &str = "cc-captcha-verified";
    pub const TRACEPARENT: &str = conode_fanout::TRACEPARENT_HEADER;
}

/// Body of `POST /api/v1/commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub document: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
}

/// `{status: "ok", content}` or `{status: "error", error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse {
    Ok { content: Value },
    Error { error: String },
}

impl ApiResponse {
    pub fn ok(content: Value) -> Self {
        Self::Ok { content }
    }

    pub fn error(err: &NodeError) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }

    /// HTTP status and body for a commit result.
    pub fn from_commit(result: &Result<CommitOutcome>) -> (u16, Self) {
        match result {
            Ok(outcome) => (outcome.status, Self::ok(outcome.resource.clone())),
            Err(e) => (e.http_status(), Self::error(e)),
        }
    }
}

/// Body of `GET /api/v1/timelines/recent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsResponse {
    pub items: Vec<TimelineItem>,
}

/// Body of `GET /api/v1/timelines/{id}/chunks`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunksResponse {
    pub chunks: BTreeMap<String, Chunk>,
}
