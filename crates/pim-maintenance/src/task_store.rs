//! Persisted maintenance state.
//!
//! A small key/value table scoped per maintenance service instance:
//!
//! - `current_task` - integer [`TaskKind`]
//! - `cp_list`      - JSON array of provider addresses, only for upgrades
//! - `lease:<addr>` - JSON [`Lease`] while the orchestrator holds a provider lock
//!
//! The task record is written before a long-running task starts and cleared
//! only when it finishes successfully, so a record found at startup means
//! the previous run was interrupted.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pim_provider::ResourceAddress;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{MaintenanceError, MaintenanceResult};

const CURRENT_TASK_KEY: &str = "current_task";
const TARGET_LIST_KEY: &str = "cp_list";
const LEASE_PREFIX: &str = "lease:";

/// Current schema version of the state database.
const CURRENT_VERSION: i32 = 1;

/// Kind of the long-running task in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    None,
    Upgrade,
    LocaleChange,
    Startup,
}

impl TaskKind {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Upgrade => 1,
            Self::LocaleChange => 2,
            Self::Startup => 3,
        }
    }

    pub fn from_i64(value: i64) -> MaintenanceResult<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Upgrade),
            2 => Ok(Self::LocaleChange),
            3 => Ok(Self::Startup),
            other => Err(MaintenanceError::InvalidState(format!(
                "unknown task kind {other}"
            ))),
        }
    }
}

/// The persisted task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub kind: TaskKind,
    /// Providers to upgrade; empty unless `kind` is `Upgrade`.
    pub targets: Vec<ResourceAddress>,
}

impl TaskRecord {
    pub fn none() -> Self {
        Self {
            kind: TaskKind::None,
            targets: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.kind != TaskKind::None
    }
}

/// A recorded claim on a provider lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub target: ResourceAddress,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// SQLite-backed maintenance state.
pub struct TaskStore {
    conn: Mutex<Connection>,
    scope: String,
}

impl TaskStore {
    /// Open (creating if needed) the state database at `path`.
    pub fn open(path: &Path, scope: impl Into<String>) -> MaintenanceResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn, scope.into())
    }

    /// In-memory state, for tests.
    pub fn in_memory(scope: impl Into<String>) -> MaintenanceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, scope.into())
    }

    fn from_connection(mut conn: Connection, scope: String) -> MaintenanceResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            scope,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The current task record; `TaskKind::None` when nothing is pending.
    pub fn current(&self) -> MaintenanceResult<TaskRecord> {
        let conn = self.conn.lock().expect("lock poisoned");

        let kind: Option<i64> = conn
            .query_row(
                "SELECT value FROM maintenance_state WHERE scope = ?1 AND key = ?2",
                params![self.scope, CURRENT_TASK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let kind = match kind {
            Some(value) => TaskKind::from_i64(value)?,
            None => return Ok(TaskRecord::none()),
        };

        let targets = if kind == TaskKind::Upgrade {
            let list: Option<String> = conn
                .query_row(
                    "SELECT value FROM maintenance_state WHERE scope = ?1 AND key = ?2",
                    params![self.scope, TARGET_LIST_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            match list {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        Ok(TaskRecord { kind, targets })
    }

    /// Record that `kind` has started. Replaces any previous record.
    pub fn begin(&self, kind: TaskKind, targets: &[ResourceAddress]) -> MaintenanceResult<()> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO maintenance_state (scope, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![self.scope, CURRENT_TASK_KEY, kind.as_i64()],
        )?;
        if kind == TaskKind::Upgrade {
            tx.execute(
                "INSERT INTO maintenance_state (scope, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![self.scope, TARGET_LIST_KEY, serde_json::to_string(targets)?],
            )?;
        } else {
            tx.execute(
                "DELETE FROM maintenance_state WHERE scope = ?1 AND key = ?2",
                params![self.scope, TARGET_LIST_KEY],
            )?;
        }
        tx.commit()?;

        debug!(scope = %self.scope, kind = ?kind, targets = targets.len(), "Task record written");
        Ok(())
    }

    /// Remove the task record.
    pub fn clear(&self) -> MaintenanceResult<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "DELETE FROM maintenance_state WHERE scope = ?1 AND key IN (?2, ?3)",
            params![self.scope, CURRENT_TASK_KEY, TARGET_LIST_KEY],
        )?;
        debug!(scope = %self.scope, "Task record cleared");
        Ok(())
    }

    /// Record that `owner` holds the lock on `target` for `ttl`.
    ///
    /// Fails with [`MaintenanceError::LeaseHeld`] while another owner holds
    /// an unexpired lease on `target`. An expired lease, or one already held
    /// by `owner`, is replaced.
    pub fn acquire_lease(
        &self,
        target: &ResourceAddress,
        owner: &str,
        ttl: Duration,
    ) -> MaintenanceResult<Lease> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MaintenanceError::InvalidState(format!("lease duration: {e}")))?;
        let now = Utc::now();
        let lease = Lease {
            target: target.clone(),
            owner: owner.to_string(),
            expires_at: now + ttl,
        };

        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT value FROM maintenance_state WHERE scope = ?1 AND key = ?2",
                params![self.scope, lease_key(target)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(json) = existing {
            let held: Lease = serde_json::from_str(&json)?;
            if held.owner != owner && !held.is_expired(now) {
                return Err(MaintenanceError::LeaseHeld {
                    target: target.to_string(),
                    owner: held.owner,
                });
            }
            if held.owner != owner {
                debug!(target_address = %target, previous_owner = %held.owner, "Taking over expired lease");
            }
        }

        tx.execute(
            "INSERT INTO maintenance_state (scope, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![self.scope, lease_key(target), serde_json::to_string(&lease)?],
        )?;
        tx.commit()?;
        Ok(lease)
    }

    /// Forget the lease on `target`. Returns whether one existed.
    pub fn release_lease(&self, target: &ResourceAddress) -> MaintenanceResult<bool> {
        let conn = self.conn.lock().expect("lock poisoned");
        let removed = conn.execute(
            "DELETE FROM maintenance_state WHERE scope = ?1 AND key = ?2",
            params![self.scope, lease_key(target)],
        )?;
        Ok(removed > 0)
    }

    /// Every recorded lease.
    pub fn leases(&self) -> MaintenanceResult<Vec<Lease>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT value FROM maintenance_state WHERE scope = ?1 AND key LIKE ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![self.scope, format!("{LEASE_PREFIX}%")], |row| {
            row.get::<_, String>(0)
        })?;

        let mut leases = Vec::new();
        for row in rows {
            leases.push(serde_json::from_str(&row?)?);
        }
        Ok(leases)
    }

    /// Report and drop leases left behind by a previous run.
    ///
    /// A leftover lease means the previous process stopped between locking
    /// and unlocking a provider. Leases owned by `owner` or already expired
    /// are dropped and returned; an unexpired lease of another owner is
    /// still live and stays in place.
    pub fn clear_leftover_leases(&self, owner: &str) -> MaintenanceResult<Vec<Lease>> {
        let now = Utc::now();
        let mut cleared = Vec::new();
        for lease in self.leases()? {
            if lease.owner != owner && !lease.is_expired(now) {
                warn!(
                    target_address = %lease.target,
                    owner = %lease.owner,
                    expires_at = %lease.expires_at,
                    "Lock lease still held by another owner"
                );
                continue;
            }
            warn!(
                target_address = %lease.target,
                owner = %lease.owner,
                expires_at = %lease.expires_at,
                "Found lock lease from an interrupted run"
            );
            self.release_lease(&lease.target)?;
            cleared.push(lease);
        }
        if !cleared.is_empty() {
            info!(count = cleared.len(), "Cleared leftover lock leases");
        }
        Ok(cleared)
    }
}

fn lease_key(target: &ResourceAddress) -> String {
    format!("{LEASE_PREFIX}{target}")
}

fn run_migrations(conn: &mut Connection) -> MaintenanceResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    debug!(current_version, target_version = CURRENT_VERSION, "Checking task store schema");

    if current_version < 1 {
        tx.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS maintenance_state (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (scope, key)
            );
            ",
        )?;
        tx.execute(
            "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
            params![1, "maintenance_state"],
        )?;
        debug!(version = 1, "Task store migration applied");
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addrs(list: &[&str]) -> Vec<ResourceAddress> {
        list.iter().map(|a| ResourceAddress::from_string(*a)).collect()
    }

    #[test]
    fn empty_store_has_no_task() {
        let store = TaskStore::in_memory("svc").unwrap();
        let record = store.current().unwrap();
        assert_eq!(record, TaskRecord::none());
        assert!(!record.is_pending());
    }

    #[test]
    fn upgrade_record_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        {
            let store = TaskStore::open(&path, "svc").unwrap();
            store.begin(TaskKind::Upgrade, &addrs(&["a", "b"])).unwrap();
        }

        let reopened = TaskStore::open(&path, "svc").unwrap();
        let record = reopened.current().unwrap();
        assert_eq!(record.kind, TaskKind::Upgrade);
        assert_eq!(record.targets, addrs(&["a", "b"]));

        reopened.clear().unwrap();
        assert_eq!(reopened.current().unwrap(), TaskRecord::none());
    }

    #[test]
    fn non_upgrade_kinds_drop_target_list() {
        let store = TaskStore::in_memory("svc").unwrap();
        store.begin(TaskKind::Upgrade, &addrs(&["a"])).unwrap();
        store.begin(TaskKind::LocaleChange, &addrs(&["ignored"])).unwrap();

        let record = store.current().unwrap();
        assert_eq!(record.kind, TaskKind::LocaleChange);
        assert!(record.targets.is_empty());
    }

    #[test]
    fn scopes_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let first = TaskStore::open(&path, "first").unwrap();
        let second = TaskStore::open(&path, "second").unwrap();

        first.begin(TaskKind::Startup, &[]).unwrap();
        assert_eq!(second.current().unwrap().kind, TaskKind::None);
    }

    #[test]
    fn unknown_kind_is_invalid_state() {
        let store = TaskStore::in_memory("svc").unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO maintenance_state (scope, key, value) VALUES ('svc', 'current_task', 42)",
                [],
            )
            .unwrap();
        assert!(matches!(store.current(), Err(MaintenanceError::InvalidState(_))));
    }

    #[test]
    fn leases_are_recorded_and_cleared() {
        let store = TaskStore::in_memory("svc").unwrap();
        let target = ResourceAddress::from_string("contacts");

        let lease = store
            .acquire_lease(&target, "orchestrator-1", Duration::from_secs(60))
            .unwrap();
        assert!(!lease.is_expired(Utc::now()));
        assert_eq!(store.leases().unwrap(), vec![lease]);

        assert!(store.release_lease(&target).unwrap());
        assert!(!store.release_lease(&target).unwrap());
        assert!(store.leases().unwrap().is_empty());
    }

    #[test]
    fn leftover_leases_are_reported_once() {
        let store = TaskStore::in_memory("svc").unwrap();
        store
            .acquire_lease(&"a".into(), "old", Duration::from_secs(0))
            .unwrap();
        store
            .acquire_lease(&"b".into(), "old", Duration::from_secs(600))
            .unwrap();
        store
            .acquire_lease(&"c".into(), "svc:new", Duration::from_secs(600))
            .unwrap();

        let leftover = store.clear_leftover_leases("svc:new").unwrap();
        let targets: Vec<_> = leftover.iter().map(|l| l.target.to_string()).collect();
        assert_eq!(targets, vec!["a", "c"]);
        assert!(leftover[0].is_expired(Utc::now()));
        assert!(store.clear_leftover_leases("svc:new").unwrap().is_empty());

        // The live lease of the other owner is untouched.
        let remaining = store.leases().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].owner, "old");
    }

    #[test]
    fn live_lease_excludes_other_owners() {
        let store = TaskStore::in_memory("svc").unwrap();
        let target = ResourceAddress::from_string("contacts");
        store
            .acquire_lease(&target, "first", Duration::from_secs(600))
            .unwrap();

        let err = store
            .acquire_lease(&target, "second", Duration::from_secs(600))
            .unwrap_err();
        assert!(matches!(err, MaintenanceError::LeaseHeld { ref owner, .. } if owner == "first"));
        assert_eq!(store.leases().unwrap()[0].owner, "first");

        // The holder may renew.
        store
            .acquire_lease(&target, "first", Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let store = TaskStore::in_memory("svc").unwrap();
        let target = ResourceAddress::from_string("contacts");
        store
            .acquire_lease(&target, "first", Duration::from_secs(0))
            .unwrap();

        let lease = store
            .acquire_lease(&target, "second", Duration::from_secs(600))
            .unwrap();
        assert_eq!(lease.owner, "second");
        assert_eq!(store.leases().unwrap(), vec![lease]);
    }

    #[test]
    fn half_applied_migration_is_completed_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        {
            // Table created, but the process died before the version row.
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                 );
                 CREATE TABLE maintenance_state (
                    scope TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (scope, key)
                 );
                 INSERT INTO maintenance_state (scope, key, value) VALUES ('svc', 'current_task', 3);",
            )
            .unwrap();
        }

        let store = TaskStore::open(&path, "svc").unwrap();
        assert_eq!(store.current().unwrap().kind, TaskKind::Startup);
        store.begin(TaskKind::Upgrade, &addrs(&["a"])).unwrap();
        drop(store);

        let reopened = TaskStore::open(&path, "svc").unwrap();
        assert_eq!(reopened.current().unwrap().targets, addrs(&["a"]));
        let versions: i64 = reopened
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
