//! Atomic batches across every store a provider owns.
//!
//! ```text
//! resolve routes → lock handles (declaration order) → BEGIN each
//!   → execute in order, buffering notifications
//!   → COMMIT in reverse order → release handles → flush notifications
//! ```
//!
//! Any failure before the commits rolls back every transaction and discards
//! the buffered notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::notify::{ChangeObserver, NotificationBuffer};
use crate::routes::RouteMap;
use crate::sql;
use crate::store::{StoreConnection, StoreHandle};
use crate::store_set::{Location, StoreSet};
use crate::types::{OpenMode, ResourceAddress, Selection, Values};
use crate::{ProviderError, ProviderResult};

/// One mutation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        target: ResourceAddress,
        values: Values,
    },
    Update {
        target: ResourceAddress,
        values: Values,
        selection: Option<Selection>,
    },
    Delete {
        target: ResourceAddress,
        selection: Option<Selection>,
    },
}

impl Operation {
    pub fn insert(target: impl Into<ResourceAddress>, values: Values) -> Self {
        Self::Insert {
            target: target.into(),
            values,
        }
    }

    pub fn update(
        target: impl Into<ResourceAddress>,
        values: Values,
        selection: Option<Selection>,
    ) -> Self {
        Self::Update {
            target: target.into(),
            values,
            selection,
        }
    }

    pub fn delete(target: impl Into<ResourceAddress>, selection: Option<Selection>) -> Self {
        Self::Delete {
            target: target.into(),
            selection,
        }
    }

    pub fn target(&self) -> &ResourceAddress {
        match self {
            Self::Insert { target, .. } | Self::Update { target, .. } | Self::Delete { target, .. } => {
                target
            }
        }
    }
}

/// Outcome of one operation of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Inserted { row_id: i64 },
    Updated { count: usize },
    Deleted { count: usize },
}

impl OpResult {
    /// Whether the operation changed anything and should be notified.
    pub fn changed(&self) -> bool {
        match *self {
            Self::Inserted { .. } => true,
            Self::Updated { count } | Self::Deleted { count } => count > 0,
        }
    }
}

/// Execute one operation against an open connection.
pub(crate) fn execute(conn: &Connection, table: &str, op: &Operation) -> ProviderResult<OpResult> {
    match op {
        Operation::Insert { values, .. } => Ok(OpResult::Inserted {
            row_id: sql::insert(conn, table, values)?,
        }),
        Operation::Update {
            values, selection, ..
        } => Ok(OpResult::Updated {
            count: sql::update(conn, table, values, selection.as_ref())?,
        }),
        Operation::Delete { selection, .. } => Ok(OpResult::Deleted {
            count: sql::delete(conn, table, selection.as_ref())?,
        }),
    }
}

/// Apply `operations` atomically and notify `observer` after commit.
pub(crate) fn apply_batch<O: ChangeObserver + ?Sized>(
    stores: &StoreSet,
    routes: &RouteMap,
    operations: &[Operation],
    observer: &O,
) -> ProviderResult<Vec<OpResult>> {
    let mut locations: Vec<Location> = Vec::with_capacity(operations.len());
    for op in operations {
        let located = routes
            .resolve(op.target())
            .and_then(|route| stores.locate(route))
            .map_err(|e| ProviderError::apply(0, e))?;
        locations.push(located);
    }

    // Distinct executing handles, in declaration order.
    let handles: BTreeMap<usize, Arc<StoreHandle>> = locations
        .iter()
        .map(|l| (l.index, l.handle.clone()))
        .collect();
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    let mut slots: BTreeMap<usize, usize> = BTreeMap::new();
    let mut conns: Vec<StoreConnection<'_>> = Vec::with_capacity(handles.len());
    for (index, handle) in &handles {
        let conn = match handle.open(OpenMode::Write) {
            Ok(conn) => conn,
            Err(e) => {
                rollback_all(&conns);
                return Err(ProviderError::apply(0, e));
            }
        };
        let begin = if handle.is_wal() {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN EXCLUSIVE"
        };
        if let Err(e) = conn.execute_batch(begin) {
            rollback_all(&conns);
            return Err(ProviderError::apply(0, e.into()));
        }
        slots.insert(*index, conns.len());
        conns.push(conn);
    }

    let mut buffer = NotificationBuffer::new();
    let mut results = Vec::with_capacity(operations.len());
    for (i, (op, location)) in operations.iter().zip(&locations).enumerate() {
        let conn = &conns[slots[&location.index]];
        match execute(conn, &location.table, op) {
            Ok(result) => {
                if result.changed() {
                    buffer.record(op.target().clone());
                }
                results.push(result);
            }
            Err(e) => {
                warn!(target_address = %op.target(), completed = i, error = %e, "Batch operation failed, rolling back");
                rollback_all(&conns);
                buffer.discard();
                return Err(ProviderError::apply(i, e));
            }
        }
    }

    // End transactions in reverse order of opening.
    for n in (0..conns.len()).rev() {
        if let Err(e) = conns[n].execute_batch("COMMIT") {
            warn!(error = %e, "Batch commit failed, rolling back remaining transactions");
            rollback_all(&conns[..=n]);
            buffer.discard();
            return Err(ProviderError::apply(results.len(), e.into()));
        }
    }
    drop(conns);

    let delivered = buffer.flush_all(observer);
    debug!(operations = results.len(), notifications = delivered, "Batch committed");
    Ok(results)
}

fn rollback_all(conns: &[StoreConnection<'_>]) {
    for conn in conns.iter().rev() {
        if conn.is_autocommit() {
            continue;
        }
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "Rollback failed");
        }
    }
}
