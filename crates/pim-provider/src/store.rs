//! Store handles: the open/close/migrate lifecycle of one SQLite database.
//!
//! A handle is created without touching the filesystem. The connection is
//! opened lazily on the first request, which is also when any pending schema
//! migration runs. Provider construction therefore never blocks on migration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::sql::quote_ident;
use crate::types::OpenMode;
use crate::{ProviderError, ProviderResult};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Journal mode requested for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-ahead logging; batches use non-exclusive transactions.
    Wal,
    /// Rollback journal; batches use exclusive transactions.
    Delete,
}

/// Schema migration hook, run when the on-disk version is behind.
pub trait SchemaMigration: Send + Sync {
    /// Bring the schema from `from` to `to`. Runs inside a transaction.
    fn migrate(&self, conn: &Connection, from: u32, to: u32) -> rusqlite::Result<()>;
}

/// Static description of one store.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub name: String,
    pub path: PathBuf,
    pub version: u32,
    pub journal: JournalMode,
    /// Name of the store whose connection mounts this one with `ATTACH`.
    pub attach_to: Option<String>,
}

impl StoreSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            version,
            journal: JournalMode::Wal,
            attach_to: None,
        }
    }

    pub fn journal(mut self, journal: JournalMode) -> Self {
        self.journal = journal;
        self
    }

    pub fn attached_to(mut self, host: impl Into<String>) -> Self {
        self.attach_to = Some(host.into());
        self
    }
}

/// Owner of one database's connection lifecycle.
pub struct StoreHandle {
    spec: StoreSpec,
    migration: Arc<dyn SchemaMigration>,
    /// Stores mounted into this handle's connection.
    attachments: Vec<Arc<StoreHandle>>,
    conn: Mutex<Option<Connection>>,
    wal: AtomicBool,
    opens: AtomicU64,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.spec.name)
            .field("path", &self.spec.path)
            .field("version", &self.spec.version)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Exclusive access to an open connection. Released on drop.
pub struct StoreConnection<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
}

impl std::ops::Deref for StoreConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // `open` fills the slot before handing out a guard; `close` takes the same mutex.
        self.guard
            .as_ref()
            .expect("store connection slot emptied while guarded")
    }
}

impl StoreHandle {
    pub fn new(spec: StoreSpec, migration: Arc<dyn SchemaMigration>) -> Self {
        Self::with_attachments(spec, migration, Vec::new())
    }

    pub(crate) fn with_attachments(
        spec: StoreSpec,
        migration: Arc<dyn SchemaMigration>,
        attachments: Vec<Arc<StoreHandle>>,
    ) -> Self {
        Self {
            spec,
            migration,
            attachments,
            conn: Mutex::new(None),
            wal: AtomicBool::new(false),
            opens: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    pub fn spec(&self) -> &StoreSpec {
        &self.spec
    }

    /// Whether this database is mounted into another handle's connection.
    pub fn is_attached(&self) -> bool {
        self.spec.attach_to.is_some()
    }

    /// Whether the last opened connection runs in WAL mode.
    pub fn is_wal(&self) -> bool {
        self.wal.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        self.conn.lock().expect("lock poisoned").is_some()
    }

    /// Number of physical connections opened so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Get the connection, opening and migrating the database if needed.
    ///
    /// `Read` puts the connection in `query_only` mode for the lifetime of
    /// the returned guard; `Write` clears it.
    pub fn open(&self, mode: OpenMode) -> ProviderResult<StoreConnection<'_>> {
        let mut slot = self.conn.lock().expect("lock poisoned");
        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        if let Some(conn) = slot.as_ref() {
            conn.pragma_update(None, "query_only", mode.is_read())?;
        }
        Ok(StoreConnection { guard: slot })
    }

    /// Close the connection if open. The next `open` reconnects.
    pub fn close(&self) {
        let conn = self.conn.lock().expect("lock poisoned").take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!(
                    store = %self.spec.name,
                    path = %self.spec.path.display(),
                    error = %e,
                    "Error while closing store connection"
                );
            } else {
                debug!(store = %self.spec.name, "Store connection closed");
            }
        }
    }

    /// Open a writable connection purely to run any pending migration.
    ///
    /// Failures are logged and reported as `false`.
    pub fn touch(&self) -> bool {
        match self.open(OpenMode::Write) {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    store = %self.spec.name,
                    path = %self.spec.path.display(),
                    error = %e,
                    "Store unavailable"
                );
                false
            }
        }
    }

    /// Schema version currently recorded in the database.
    pub fn schema_version(&self) -> ProviderResult<u32> {
        let conn = self.open(OpenMode::Read)?;
        Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    /// Run `VACUUM` and `ANALYZE` on this store's own connection.
    pub(crate) fn vacuum_analyze(&self) -> ProviderResult<()> {
        let conn = self.open(OpenMode::Write)?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }

    fn connect(&self) -> ProviderResult<Connection> {
        if let Some(parent) = self.spec.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.spec.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let wal = match self.spec.journal {
            JournalMode::Wal => {
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                mode.eq_ignore_ascii_case("wal")
            }
            JournalMode::Delete => {
                let _: String =
                    conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))?;
                false
            }
        };
        self.wal.store(wal, Ordering::SeqCst);

        self.migrate(&conn)?;

        for attached in &self.attachments {
            // The attached database has its own migration; run it before mounting.
            let was_open = attached.is_open();
            drop(attached.open(OpenMode::Write)?);
            if !was_open {
                attached.close();
            }
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_ident(attached.name())),
                [attached.path().to_string_lossy()],
            )?;
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(
            store = %self.spec.name,
            path = %self.spec.path.display(),
            wal,
            attachments = self.attachments.len(),
            "Store connection opened"
        );
        Ok(conn)
    }

    fn migrate(&self, conn: &Connection) -> ProviderResult<()> {
        let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        let target = self.spec.version;

        if current == target {
            return Ok(());
        }
        if current > target {
            return Err(ProviderError::Downgrade {
                store: self.spec.name.clone(),
                found: current,
                supported: target,
            });
        }

        info!(
            store = %self.spec.name,
            from = current,
            to = target,
            "Migrating store schema"
        );

        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = self
            .migration
            .migrate(conn, current, target)
            .and_then(|_| conn.pragma_update(None, "user_version", target));

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!(store = %self.spec.name, error = %rollback, "Rollback after failed migration failed");
                }
                Err(e.into())
            }
        }
    }
}
