//! The provider: lock-gated CRUD, batches and maintenance commands over a
//! [`StoreSet`].
//!
//! # Request path
//!
//! 1. Check the provider lock; a locked provider answers with an empty
//!    result and opens nothing.
//! 2. Resolve the address to a store and table.
//! 3. Execute (single statement, or an atomic batch).
//! 4. Notify the observer after the change is committed.
//!
//! Construction never opens a store. Connections, and with them any
//! pending schema migration, are created on the first request.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batch::{self, OpResult, Operation};
use crate::command::{CallHandler, CommandReply, CommandTarget, Method};
use crate::lock::{LockState, ProviderLock};
use crate::notify::ChangeObserver;
use crate::routes::RouteMap;
use crate::sql;
use crate::store_set::StoreSet;
use crate::types::{OpenMode, Query, ResourceAddress, Row, Selection, Values};
use crate::{ProviderError, ProviderResult};

/// A data provider built on one or more SQLite stores.
pub struct Provider<O: ChangeObserver> {
    address: ResourceAddress,
    stores: StoreSet,
    routes: RouteMap,
    lock: Arc<ProviderLock>,
    observer: Arc<O>,
    call_handler: Option<Arc<dyn CallHandler>>,
}

impl<O: ChangeObserver> Provider<O> {
    /// Creates a provider. Every route must name a declared store.
    pub fn new(
        address: impl Into<ResourceAddress>,
        stores: StoreSet,
        routes: RouteMap,
        lock: Arc<ProviderLock>,
        observer: O,
    ) -> ProviderResult<Self> {
        for (address, route) in routes.routes() {
            if stores.get(&route.store).is_none() {
                return Err(ProviderError::Config(format!(
                    "route {address} names unknown store {}",
                    route.store
                )));
            }
        }

        Ok(Self {
            address: address.into(),
            stores,
            routes,
            lock,
            observer: Arc::new(observer),
            call_handler: None,
        })
    }

    /// Install the handler for provider-specific commands.
    pub fn with_call_handler(mut self, handler: impl CallHandler + 'static) -> Self {
        self.call_handler = Some(Arc::new(handler));
        self
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn routes(&self) -> &RouteMap {
        &self.routes
    }

    pub fn lock(&self) -> &Arc<ProviderLock> {
        &self.lock
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Run a query. Empty while locked.
    pub fn query(&self, query: &Query) -> ProviderResult<Vec<Row>> {
        if self.rejected("query", &query.target) {
            return Ok(Vec::new());
        }

        let route = self.routes.resolve(&query.target)?;
        let location = self.stores.locate(route)?;
        let conn = location.handle.open(OpenMode::Read)?;
        sql::select(
            &conn,
            &location.table,
            query.columns.as_deref(),
            query.selection.as_ref(),
            query.order_by.as_deref(),
        )
    }

    /// Insert one row and return its rowid. `None` while locked.
    pub fn insert(&self, target: &ResourceAddress, values: &Values) -> ProviderResult<Option<i64>> {
        let op = Operation::insert(target.clone(), values.clone());
        Ok(match self.write_one("insert", &op)? {
            Some(OpResult::Inserted { row_id }) => Some(row_id),
            _ => None,
        })
    }

    /// Update matching rows. `0` while locked.
    pub fn update(
        &self,
        target: &ResourceAddress,
        values: &Values,
        selection: Option<&Selection>,
    ) -> ProviderResult<usize> {
        let op = Operation::update(target.clone(), values.clone(), selection.cloned());
        Ok(match self.write_one("update", &op)? {
            Some(OpResult::Updated { count }) => count,
            _ => 0,
        })
    }

    /// Delete matching rows. `0` while locked.
    pub fn delete(&self, target: &ResourceAddress, selection: Option<&Selection>) -> ProviderResult<usize> {
        let op = Operation::delete(target.clone(), selection.cloned());
        Ok(match self.write_one("delete", &op)? {
            Some(OpResult::Deleted { count }) => count,
            _ => 0,
        })
    }

    /// Apply a batch atomically. Empty while locked.
    ///
    /// Notifications for the batch are delivered, in order and with
    /// duplicates, only after every transaction has committed.
    pub fn apply_batch(&self, operations: &[Operation]) -> ProviderResult<Vec<OpResult>> {
        if self.rejected("apply_batch", &self.address) {
            return Ok(Vec::new());
        }
        batch::apply_batch(&self.stores, &self.routes, operations, self.observer.as_ref())
    }

    /// Close, reopen and close every store so pending migrations run.
    pub fn upgrade(&self) -> bool {
        info!(provider = %self.address, "Applying pending schema upgrades");
        let success = self.stores.upgrade();
        if !success {
            warn!(provider = %self.address, "Schema upgrade incomplete");
        }
        success
    }

    /// Vacuum and analyze every store.
    pub fn maintain(&self) -> bool {
        info!(provider = %self.address, "Running vacuum/analyze");
        self.stores.vacuum_analyze()
    }

    /// Handle a command according to the lock state.
    ///
    /// Locked: only `db_upgrade` (lock stays held) and `db_unlock` proceed.
    /// Unlocked: `db_lock` and `db_maintenance_start` are handled here,
    /// everything else goes to the call handler.
    pub fn dispatch(&self, method: &Method, arg: Option<&Value>) -> CommandReply {
        match (self.lock.state(), method) {
            (_, Method::DbUnlock) => {
                self.lock.unlock();
                CommandReply::ok()
            }
            (LockState::Locked, Method::DbUpgrade) => CommandReply::from_success(self.upgrade()),
            (LockState::Locked, other) => {
                debug!(provider = %self.address, method = %other, "Command rejected while locked");
                CommandReply::failed()
            }
            (LockState::Unlocked, Method::DbLock) => {
                self.lock.lock();
                CommandReply::ok()
            }
            (LockState::Unlocked, Method::DbMaintenanceStart) => {
                CommandReply::from_success(self.maintain())
            }
            (LockState::Unlocked, other) => self.forward(other, arg),
        }
    }

    fn forward(&self, method: &Method, arg: Option<&Value>) -> CommandReply {
        let Some(handler) = &self.call_handler else {
            debug!(provider = %self.address, method = %method, "No handler for command");
            return CommandReply::failed();
        };
        match handler.call(&self.stores, method.as_str(), arg) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(provider = %self.address, method = %method, error = %e, "Command failed");
                CommandReply::failed()
            }
        }
    }

    fn rejected(&self, operation: &str, target: &ResourceAddress) -> bool {
        if self.lock.is_locked() {
            debug!(provider = %self.address, operation, target = %target, "Rejected while locked");
            return true;
        }
        false
    }

    fn write_one(&self, operation: &str, op: &Operation) -> ProviderResult<Option<OpResult>> {
        if self.rejected(operation, op.target()) {
            return Ok(None);
        }

        let route = self.routes.resolve(op.target())?;
        let location = self.stores.locate(route)?;
        let result = {
            let conn = location.handle.open(OpenMode::Write)?;
            batch::execute(&conn, &location.table, op)?
        };

        if result.changed() {
            self.observer.on_change(op.target());
        }
        Ok(Some(result))
    }
}

impl<O: ChangeObserver> CommandTarget for Provider<O> {
    fn address(&self) -> &ResourceAddress {
        &self.address
    }

    fn dispatch(&self, method: &Method, arg: Option<&Value>) -> CommandReply {
        Provider::dispatch(self, method, arg)
    }
}
