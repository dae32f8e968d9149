//! # pim-provider
//!
//! The shared base layer of the PIM data providers (contacts, messages,
//! folders, rules, analytics): SQLite store handles, atomic batches that
//! span every store a provider owns, deferred change notifications, and the
//! cooperative lock used by background maintenance.
//!
//! ## Principles
//!
//! - **Stores open lazily** - constructing a provider never touches a database
//! - **Batches are all or nothing** - across every store the batch touches
//! - **Notifications reflect committed reality** - flushed after commit, in order, duplicates kept
//! - **A locked provider is offline** - empty results, no database I/O
//!
//! ## Architecture
//!
//! ```text
//! REQUEST:
//!   lock gate → route → store handle(s) → commit → notify
//!
//! MAINTENANCE:
//!   db_lock → db_upgrade (close, touch all, close) → db_unlock
//! ```
//!
//! ## Example
//!
//! ```rust
//! use pim_provider::{
//!     values, LockRegistry, Operation, Provider, RecordingObserver, RouteMap, SchemaMigration,
//!     StoreSet, StoreSpec,
//! };
//!
//! struct Schema;
//!
//! impl SchemaMigration for Schema {
//!     fn migrate(&self, conn: &rusqlite::Connection, _from: u32, _to: u32) -> rusqlite::Result<()> {
//!         conn.execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)")
//!     }
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let stores = StoreSet::builder()
//!     .store(StoreSpec::new("main", dir.path().join("contacts.db"), 1), Schema)
//!     .build()
//!     .unwrap();
//! let routes = RouteMap::new().route("contacts/people", "main", "people");
//! let locks = LockRegistry::new();
//! let provider = Provider::new(
//!     "contacts",
//!     stores,
//!     routes,
//!     locks.lock_for("contacts"),
//!     RecordingObserver::new(),
//! )
//! .unwrap();
//!
//! provider
//!     .apply_batch(&[
//!         Operation::insert("contacts/people", values([("name", "Ada".to_string())])),
//!         Operation::insert("contacts/people", values([("name", "Alan".to_string())])),
//!     ])
//!     .unwrap();
//! assert_eq!(provider.observer().len(), 2);
//! ```

pub mod batch;
pub mod command;
pub mod error;
pub mod lock;
pub mod notify;
pub mod provider;
pub mod registry;
pub mod routes;
pub mod sql;
pub mod store;
pub mod store_set;
pub mod types;

#[cfg(test)]
mod tests;

pub use batch::{OpResult, Operation};
pub use command::{CallHandler, CommandReply, CommandTarget, CommandTransport, Method};
pub use error::{ProviderError, ProviderResult};
pub use lock::{LockRegistry, LockState, ProviderLock};
pub use notify::{
    ChangeObserver, ChangeSubscription, NotificationBuffer, NotificationHub, NullObserver,
    RecordingObserver,
};
pub use provider::Provider;
pub use registry::{ProviderFactory, ProviderRegistry, ProviderRegistryBuilder};
pub use routes::{Route, RouteMap};
pub use store::{JournalMode, SchemaMigration, StoreConnection, StoreHandle, StoreSpec};
pub use store_set::{Location, StoreSet, StoreSetBuilder};
pub use types::{values, OpenMode, Query, ResourceAddress, Row, Selection, Values};
