//! # conode
//!
//! One domain of a federated, content-addressed social substrate.
//!
//! ## Overview
//!
//! A [`Node`] accepts signed documents and turns them into records:
//!
//! - **Key chains**: documents are signed by an entity's root key or a
//!   delegated subkey that was active at `signedAt`
//! - **Record services**: each document type plans its own writes, guarded by
//!   the policy engine
//! - **Commit log**: every accepted document is logged once, in the same
//!   transaction as the records derived from it
//! - **Fan-out**: accepted commits are published to realtime connections and
//!   forwarded to the peer domains that need them
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conode::{CommitContext, Node, NodeConfig};
//! use conode::core::CommitMode;
//! use conode::store::SqliteStore;
//!
//! async fn example(document: &str, signature: &str) {
//!     let store = SqliteStore::open("conode.db").unwrap();
//!     let node = Node::new(NodeConfig::for_domain("example.com"), store, None);
//!
//!     let outcome = node
//!         .commit(&CommitContext::client(), CommitMode::Execute, document, signature, None)
//!         .await
//!         .unwrap();
//!     println!("{} {}", outcome.status, outcome.document_id);
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `conode::core` - Identifiers, crypto, documents and records
//! - `conode::policy` - The policy language
//! - `conode::store` - Storage abstraction, SQLite and in-memory stores
//! - `conode::fanout` - Realtime hub and peer dispatch

mod access;
pub mod api;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod keychain;
pub mod node;
mod services;

pub use conode_core as core;
pub use conode_fanout as fanout;
pub use conode_policy as policy;
pub use conode_store as store;

pub use api::{ApiResponse, ChunksResponse, CommitRequest, ItemsResponse};
pub use broker::{NormalizedTimeline, TimelineBroker};
pub use config::NodeConfig;
pub use context::{CommitContext, Origin};
pub use error::{NodeError, Result};
pub use keychain::{KeyChain, MAX_CHAIN_DEPTH};
pub use node::{CommitOutcome, Node};
