//! Per-request commit context.

use std::time::{Duration, Instant};

use conode_policy::RequesterClaims;

use crate::api::headers;

/// Where a commit came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Origin {
    /// A client of this node.
    #[default]
    Client,
    /// Another domain forwarding a commit.
    Peer(String),
}

/// Identity and deadline information propagated from the transport.
#[derive(Debug, Clone, Default)]
pub struct CommitContext {
    pub requester_type: Option<String>,
    pub requester_context: Option<String>,
    pub requester_keychain: Option<String>,
    pub passport: Option<String>,
    pub captcha_verified: bool,
    pub traceparent: Option<String>,
    pub deadline: Option<Instant>,
    pub origin: Origin,
}

impl CommitContext {
    pub fn client() -> Self {
        Self::default()
    }

    pub fn from_peer(domain: impl Into<String>) -> Self {
        Self {
            origin: Origin::Peer(domain.into()),
            ..Self::default()
        }
    }

    /// Fill the identity fields from request headers.
    pub fn from_headers<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut ctx = Self::default();
        for (name, value) in pairs {
            let value = value.to_string();
            match name.to_ascii_lowercase().as_str() {
                headers::REQUESTER_TYPE => ctx.requester_type = Some(value),
                headers::REQUESTER_CONTEXT => ctx.requester_context = Some(value),
                headers::REQUESTER_KEYCHAIN => ctx.requester_keychain = Some(value),
                headers::PASSPORT => ctx.passport = Some(value),
                headers::CAPTCHA_VERIFIED => ctx.captcha_verified = value == "true",
                headers::TRACEPARENT => ctx.traceparent = Some(value),
                _ => {}
            }
        }
        ctx
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_traceparent(mut self, traceparent: impl Into<String>) -> Self {
        self.traceparent = Some(traceparent.into());
        self
    }

    /// The identity headers as policy claims.
    pub fn claims(&self) -> RequesterClaims {
        RequesterClaims {
            requester_type: self.requester_type.clone(),
            requester_context: self.requester_context.clone(),
            requester_keychain: self.requester_keychain.clone(),
            passport: self.passport.clone(),
            captcha_verified: self.captcha_verified,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The forwarding domain, for peer commits.
    pub fn origin_domain(&self) -> Option<&str> {
        match &self.origin {
            Origin::Client => None,
            Origin::Peer(domain) => Some(domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_headers() {
        let ctx = CommitContext::from_headers([
            ("cc-requester-type", "1"),
            ("CC-Captcha-Verified", "true"),
            ("traceparent", "00-abc-def-01"),
            ("x-unrelated", "ignored"),
        ]);
        assert_eq!(ctx.requester_type.as_deref(), Some("1"));
        assert!(ctx.captcha_verified);
        assert_eq!(ctx.traceparent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(ctx.origin, Origin::Client);

        let claims = ctx.claims();
        assert!(claims.captcha_verified);
        assert_eq!(claims.requester_type.as_deref(), Some("1"));
        assert!(claims.passport.is_none());
    }

    #[test]
    fn test_deadline() {
        assert!(!CommitContext::client().is_expired());
        assert!(CommitContext::client().with_timeout(Duration::ZERO).is_expired());
        assert_eq!(CommitContext::from_peer("b.example").origin_domain(), Some("b.example"));
    }
}
