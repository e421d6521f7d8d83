//! # conode store
//!
//! Storage for a conode node. The commit log is the authoritative transcript;
//! every other table is derived state written in the same transaction as the
//! log entry that produced it.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`CommitBatch`] / [`Mutation`] - One accepted commit and the state it derives
//! - [`ApplyResult`] - Applied, duplicate or conflicting
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conode_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("conode.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     // let result = store.apply_commit(batch).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent commits**: Re-applying the same document returns `Duplicate`
//! - **Conflict detection**: A different document under the same id returns `Conflict`
//! - **Deadlines**: A batch whose deadline passes before commit is rolled back
//! - **Schema interning**: Schema URLs are stored as integers, cached after commit

pub mod error;
pub mod memory;
pub mod migration;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use schema::SchemaCache;
pub use sqlite::SqliteStore;
pub use traits::{item_order, ApplyResult, CommitBatch, Mutation, Store};
