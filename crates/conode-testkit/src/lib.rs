//! # conode testkit
//!
//! Testing utilities for conode.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: secp256k1 identities, subkeys and builders that produce
//!   signed documents ready to commit
//! - **Generators**: Proptest strategies for identifiers, timeline items and
//!   policies
//!
//! ## Test Fixtures
//!
//! ```rust
//! use conode_testkit::fixtures::TestIdentity;
//!
//! let alice = TestIdentity::new();
//! let signed = alice.sign(alice.message("hello", &["t0"]));
//! assert!(signed.document.contains("\"type\":\"message\""));
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use conode_testkit::generators::policy;
//!
//! proptest! {
//!     #[test]
//!     fn any_deny_wins(p in policy("post")) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    identities, owner_only_post_policy, DocumentBuilder, SignedDocument, SubKey, TestIdentity,
};
