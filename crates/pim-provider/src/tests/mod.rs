//! Scenario tests for the provider layer.
//!
//! - `atomicity.rs`     - batches are all or nothing across stores
//! - `notifications.rs` - notification order, count and timing
//! - `lock_gating.rs`   - a locked provider does no database I/O
//! - `upgrade.rs`       - schema upgrade through the lock protocol
//! - `attached.rs`      - attached databases share the host transaction
//! - `dispatch.rs`      - command dispatch and the provider registry

mod notifications;

use std::path::Path;

use rusqlite::Connection;

use crate::{
    values, ChangeObserver, JournalMode, LockRegistry, Operation, Provider, Query,
    RecordingObserver, ResourceAddress, RouteMap, SchemaMigration, StoreSet, StoreSpec,
};

pub(crate) const CONTACTS: &str = "contacts";
pub(crate) const PEOPLE: &str = "contacts/people";
pub(crate) const GROUPS: &str = "contacts/groups";
pub(crate) const PHOTOS: &str = "contacts/photos";
pub(crate) const EVENTS: &str = "contacts/events";

/// Migration step `i` brings the schema from version `i` to `i + 1`.
pub(crate) struct Steps(pub &'static [&'static str]);

impl SchemaMigration for Steps {
    fn migrate(&self, conn: &Connection, from: u32, to: u32) -> rusqlite::Result<()> {
        for version in from..to {
            conn.execute_batch(self.0[version as usize])?;
        }
        Ok(())
    }
}

const MAIN_STEPS: &[&str] = &[
    "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
     CREATE TABLE groups (id INTEGER PRIMARY KEY, title TEXT NOT NULL);",
    "ALTER TABLE people ADD COLUMN nickname TEXT;",
];

const MEDIA_STEPS: &[&str] = &[
    "CREATE TABLE photos (id INTEGER PRIMARY KEY, uri TEXT NOT NULL);",
    "CREATE INDEX photos_uri ON photos (uri);",
];

const AUX_STEPS: &[&str] = &[
    "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL);",
    "ALTER TABLE events ADD COLUMN happened_at INTEGER;",
];

/// Three stores: `main` (WAL), `media` (rollback journal, own file) and
/// `aux` (attached to `main`).
pub(crate) fn contact_stores(dir: &Path, version: u32) -> StoreSet {
    StoreSet::builder()
        .store(StoreSpec::new("main", dir.join("contacts.db"), version), Steps(MAIN_STEPS))
        .store(
            StoreSpec::new("media", dir.join("media.db"), version).journal(JournalMode::Delete),
            Steps(MEDIA_STEPS),
        )
        .store(
            StoreSpec::new("aux", dir.join("aux.db"), version).attached_to("main"),
            Steps(AUX_STEPS),
        )
        .build()
        .unwrap()
}

pub(crate) fn contact_routes() -> RouteMap {
    RouteMap::new()
        .route(PEOPLE, "main", "people")
        .route(GROUPS, "main", "groups")
        .route(PHOTOS, "media", "photos")
        .route(EVENTS, "aux", "events")
}

pub(crate) fn contacts_with<O: ChangeObserver>(
    dir: &Path,
    version: u32,
    locks: &LockRegistry,
    observer: O,
) -> Provider<O> {
    Provider::new(
        CONTACTS,
        contact_stores(dir, version),
        contact_routes(),
        locks.lock_for(CONTACTS),
        observer,
    )
    .unwrap()
}

pub(crate) fn contacts(dir: &Path, locks: &LockRegistry) -> Provider<RecordingObserver> {
    contacts_with(dir, 1, locks, RecordingObserver::new())
}

pub(crate) fn person(name: &str) -> Operation {
    Operation::insert(PEOPLE, values([("name", name.to_string())]))
}

pub(crate) fn photo(uri: &str) -> Operation {
    Operation::insert(PHOTOS, values([("uri", uri.to_string())]))
}

pub(crate) fn group(title: &str) -> Operation {
    Operation::insert(GROUPS, values([("title", title.to_string())]))
}

pub(crate) fn event(kind: &str) -> Operation {
    Operation::insert(EVENTS, values([("kind", kind.to_string())]))
}

pub(crate) fn addresses(list: &[&str]) -> Vec<ResourceAddress> {
    list.iter().map(|a| ResourceAddress::from_string(*a)).collect()
}

pub(crate) fn count<O: ChangeObserver>(provider: &Provider<O>, target: &str) -> usize {
    provider.query(&Query::all(target)).unwrap().len()
}

/// End-to-end: batch, query, notification.
#[test]
fn basic_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts(dir.path(), &locks);

    let results = provider
        .apply_batch(&[person("Ada"), photo("file:///ada.png"), event("created")])
        .unwrap();
    assert_eq!(results.len(), 3);

    assert_eq!(count(&provider, PEOPLE), 1);
    assert_eq!(count(&provider, PHOTOS), 1);
    assert_eq!(count(&provider, EVENTS), 1);
    assert_eq!(provider.observer().changes(), addresses(&[PEOPLE, PHOTOS, EVENTS]));
}
