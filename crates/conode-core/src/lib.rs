//! # conode core
//!
//! Pure primitives for a conode node: content identifiers, entity addresses,
//! signed document envelopes and the records derived from them.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Cdid`] - 16-byte content identifier (10 data bytes + 6 time bytes)
//! - [`TypedId`] - A CDID with a one-letter resource prefix (`m`, `a`, `p`, `t`, `s`)
//! - [`Keypair`] / [`Signature`] - secp256k1 signing over Keccak-256
//! - [`Document`] - Decoded commit envelope, one variant per `type`
//! - [`ErrorKind`] - The error taxonomy shared by every crate
//!
//! ## Addresses
//!
//! Entities are addressed as `con1…` and delegated subkeys as `cck1…`. Both are
//! Bech32 encodings of `ripemd160(sha256(compressed_pubkey))`.

pub mod cdid;
pub mod crypto;
pub mod document;
pub mod error;
pub mod types;
pub mod validation;

pub use cdid::{chunk_bounds, chunk_key, Cdid, ResourceKind, TypedId, CHUNK_SECONDS};
pub use crypto::{
    address_from_public_key, is_ccid, is_ckid, keccak256, recover_address, verify, Keypair,
    Signature, ENTITY_HRP, SUBKEY_HRP,
};
pub use document::{
    AckDocument, AffiliationDocument, AssociationDocument, DeleteDocument, Document,
    DocumentBase, DocumentKind, EnactDocument, EventDocument, MessageDocument, ProfileDocument,
    RetractDocument, RevokeDocument, SubscribeDocument, SubscriptionDocument, TimelineDocument,
    TombstoneDocument,
};
pub use error::{CoreError, ErrorKind};
pub use types::{
    Ack, Association, AssociationKey, Chunk, CommitLog, CommitMode, Entity, Event, Key, Message,
    Profile, ResolverType, Subscription, SubscriptionItem, Timeline, TimelineItem,
};
pub use validation::{validate_envelope, verify_document, DEFAULT_SIGNED_AT_SKEW};
