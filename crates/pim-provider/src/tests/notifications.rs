//! Change notification tests.
//!
//! Covered:
//! - A batch recording [A, B, A, C] delivers exactly [A, B, A, C]
//! - A failed batch delivers nothing
//! - Notifications are delivered after commit
//! - Single operations notify immediately, and only when something changed
//! - Reads never notify
//! - Hub subscribers receive batch notifications in order

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::types::Value;

use super::*;
use crate::{NotificationHub, ResourceAddress, Selection};

#[test]
fn batch_delivers_in_recorded_order_with_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts(dir.path(), &locks);

    provider
        .apply_batch(&[person("Ada"), photo("file:///ada.png"), person("Alan"), group("Friends")])
        .unwrap();

    assert_eq!(
        provider.observer().changes(),
        addresses(&[PEOPLE, PHOTOS, PEOPLE, GROUPS])
    );
}

#[test]
fn failed_batch_delivers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts(dir.path(), &locks);

    let result = provider.apply_batch(&[
        person("Ada"),
        photo("file:///ada.png"),
        person("Alan"),
        Operation::insert(GROUPS, values([("title", Value::Null)])),
    ]);

    assert!(result.is_err());
    assert!(provider.observer().is_empty());
}

/// Counts rows through an independent connection each time it is notified.
struct CommittedRows {
    path: PathBuf,
    seen: Mutex<Vec<i64>>,
}

impl ChangeObserver for CommittedRows {
    fn on_change(&self, _target: &ResourceAddress) {
        let conn = Connection::open(&self.path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))
            .unwrap();
        self.seen.lock().unwrap().push(rows);
    }
}

#[test]
fn notifications_observe_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let observer = CommittedRows {
        path: dir.path().join("contacts.db"),
        seen: Mutex::new(Vec::new()),
    };
    let provider = contacts_with(dir.path(), 1, &locks, observer);

    provider
        .apply_batch(&[person("Ada"), person("Alan"), person("Grace")])
        .unwrap();

    assert_eq!(*provider.observer().seen.lock().unwrap(), vec![3, 3, 3]);
}

#[test]
fn single_operations_notify_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts(dir.path(), &locks);
    let people = ResourceAddress::from_string(PEOPLE);

    let id = provider
        .insert(&people, &values([("name", "Ada".to_string())]))
        .unwrap();
    assert!(id.is_some());
    assert_eq!(provider.observer().len(), 1);

    let updated = provider
        .update(
            &people,
            &values([("name", "Ada L.".to_string())]),
            Some(&Selection::eq("name", "Ada".to_string())),
        )
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(provider.observer().len(), 2);

    // Nothing matched, nothing to notify.
    let removed = provider
        .delete(&people, Some(&Selection::eq("name", "Nobody".to_string())))
        .unwrap();
    assert_eq!(removed, 0);
    assert_eq!(provider.observer().len(), 2);
}

#[test]
fn reads_never_notify() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts(dir.path(), &locks);

    provider.apply_batch(&[person("Ada")]).unwrap();
    provider.observer().clear();

    let rows = provider
        .query(&Query::all(PEOPLE).columns(&["name"]).order_by("name"))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(provider.observer().is_empty());
}

#[test]
fn hub_subscribers_receive_batch_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let provider = contacts_with(dir.path(), 1, &locks, NotificationHub::new());
    let subscription = provider.observer().subscribe();

    provider
        .apply_batch(&[person("Ada"), event("created"), person("Alan")])
        .unwrap();

    assert_eq!(subscription.drain(), addresses(&[PEOPLE, EVENTS, PEOPLE]));
}
