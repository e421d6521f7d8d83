//! # conode fanout
//!
//! Delivery of accepted commits beyond the local store.
//!
//! ## Overview
//!
//! - [`RealtimeHub`] - In-process fan-out to websocket connections, with one
//!   shared upstream stream per remote timeline
//! - [`PeerDispatcher`] - Per-domain bounded queues that forward commits to
//!   peers with capped exponential backoff
//! - [`PeerClient`] - The transport to other domains; [`HttpPeerClient`] talks
//!   HTTPS and secure websockets, [`memory::MemoryPeerNetwork`] simulates a
//!   federation in tests
//!
//! ## Delivery semantics
//!
//! Both paths are best-effort. A slow websocket client is disconnected
//! instead of stalling the hub, and a failed peer delivery never undoes the
//! commit that produced it.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod peer;

pub use config::{DispatchConfig, HubConfig};
pub use dispatcher::{OutboundCommit, PeerDispatcher};
pub use error::{FanoutError, Result};
pub use hub::{timeline_domain, ConnId, RealtimeHub};
pub use peer::{memory, HttpPeerClient, PeerClient, PeerResponse, TRACEPARENT_HEADER};
