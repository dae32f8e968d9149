//! The set of stores owned by one provider.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::routes::Route;
use crate::sql::{qualified_table, quote_ident};
use crate::store::{SchemaMigration, StoreHandle, StoreSpec};
use crate::types::OpenMode;
use crate::{ProviderError, ProviderResult};

/// Schema names SQLite reserves on every connection.
const RESERVED_SCHEMAS: [&str; 2] = ["main", "temp"];

/// Where an operation runs: the handle whose connection executes it and the
/// (possibly schema-qualified) table name on that connection.
#[derive(Debug, Clone)]
pub struct Location {
    pub index: usize,
    pub handle: Arc<StoreHandle>,
    pub table: String,
}

/// All store handles of one provider, in declaration order.
#[derive(Debug)]
pub struct StoreSet {
    handles: Vec<Arc<StoreHandle>>,
    index: HashMap<String, usize>,
}

/// Collects store declarations; no database is opened by `build`.
#[derive(Default)]
pub struct StoreSetBuilder {
    stores: Vec<(StoreSpec, Arc<dyn SchemaMigration>)>,
}

impl StoreSetBuilder {
    pub fn store(mut self, spec: StoreSpec, migration: impl SchemaMigration + 'static) -> Self {
        self.stores.push((spec, Arc::new(migration)));
        self
    }

    pub fn shared_store(mut self, spec: StoreSpec, migration: Arc<dyn SchemaMigration>) -> Self {
        self.stores.push((spec, migration));
        self
    }

    pub fn build(self) -> ProviderResult<StoreSet> {
        let mut names = HashMap::new();
        for (i, (spec, _)) in self.stores.iter().enumerate() {
            if names.insert(spec.name.clone(), i).is_some() {
                return Err(ProviderError::Config(format!("duplicate store name {}", spec.name)));
            }
        }

        // Attached handles first, so hosts can hold them.
        let mut attached: HashMap<String, Arc<StoreHandle>> = HashMap::new();
        for (spec, migration) in &self.stores {
            let Some(host) = spec.attach_to.as_deref() else {
                continue;
            };
            if RESERVED_SCHEMAS.iter().any(|r| r.eq_ignore_ascii_case(&spec.name)) {
                return Err(ProviderError::Config(format!(
                    "attached store cannot be named {}",
                    spec.name
                )));
            }
            match names.get(host).map(|&i| &self.stores[i].0) {
                Some(host_spec) if host_spec.attach_to.is_none() => {}
                Some(_) => {
                    return Err(ProviderError::Config(format!(
                        "store {} is attached to {host}, which is itself attached",
                        spec.name
                    )))
                }
                None => return Err(ProviderError::UnknownStore(host.to_string())),
            }
            attached.insert(
                spec.name.clone(),
                Arc::new(StoreHandle::new(spec.clone(), migration.clone())),
            );
        }

        let mut handles = Vec::with_capacity(self.stores.len());
        for (spec, migration) in &self.stores {
            if let Some(handle) = attached.get(&spec.name) {
                handles.push(handle.clone());
                continue;
            }
            let mounts: Vec<Arc<StoreHandle>> = self
                .stores
                .iter()
                .filter(|(s, _)| s.attach_to.as_deref() == Some(spec.name.as_str()))
                .filter_map(|(s, _)| attached.get(&s.name).cloned())
                .collect();
            handles.push(Arc::new(StoreHandle::with_attachments(
                spec.clone(),
                migration.clone(),
                mounts,
            )));
        }

        Ok(StoreSet {
            handles,
            index: names,
        })
    }
}

impl StoreSet {
    pub fn builder() -> StoreSetBuilder {
        StoreSetBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StoreHandle>> {
        self.index.get(name).map(|&i| &self.handles[i])
    }

    pub fn handles(&self) -> &[Arc<StoreHandle>] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Total physical connections opened across every handle.
    pub fn open_count(&self) -> u64 {
        self.handles.iter().map(|h| h.open_count()).sum()
    }

    /// Resolve a route to the connection that executes it.
    ///
    /// Routes into an attached store run on the host connection with a
    /// schema-qualified table name.
    pub fn locate(&self, route: &Route) -> ProviderResult<Location> {
        let index = *self
            .index
            .get(&route.store)
            .ok_or_else(|| ProviderError::UnknownStore(route.store.clone()))?;
        let handle = &self.handles[index];

        match handle.spec().attach_to.as_deref() {
            Some(host) => {
                let host_index = *self
                    .index
                    .get(host)
                    .ok_or_else(|| ProviderError::UnknownStore(host.to_string()))?;
                Ok(Location {
                    index: host_index,
                    handle: self.handles[host_index].clone(),
                    table: qualified_table(Some(handle.name()), &route.table),
                })
            }
            None => Ok(Location {
                index,
                handle: handle.clone(),
                table: qualified_table(None, &route.table),
            }),
        }
    }

    pub fn close_all(&self) {
        for handle in &self.handles {
            handle.close();
        }
    }

    /// Apply pending schema upgrades to every store, attached ones included.
    ///
    /// Closes everything, reopens each handle so its migration runs, then
    /// closes everything again. A handle that fails to open is logged and
    /// makes the result `false`; the remaining handles are still touched.
    pub fn upgrade(&self) -> bool {
        self.close_all();

        let mut success = true;
        for handle in &self.handles {
            if handle.touch() {
                info!(store = %handle.name(), "Store schema is current");
            } else {
                success = false;
            }
        }

        self.close_all();
        success
    }

    /// Run `VACUUM` and `ANALYZE` on every store.
    ///
    /// Attached stores are processed through their host connection. A
    /// failing store does not stop the others; the result is the AND of all.
    pub fn vacuum_analyze(&self) -> bool {
        let mut success = true;
        for handle in &self.handles {
            let result = if handle.is_attached() {
                self.vacuum_attached(handle)
            } else {
                handle.vacuum_analyze()
            };
            if let Err(e) = result {
                warn!(
                    store = %handle.name(),
                    path = %handle.path().display(),
                    error = %e,
                    "Vacuum/analyze failed"
                );
                success = false;
            }
        }
        success
    }

    fn vacuum_attached(&self, handle: &StoreHandle) -> ProviderResult<()> {
        let host_name = handle
            .spec()
            .attach_to
            .as_deref()
            .ok_or_else(|| ProviderError::Config(format!("{} is not attached", handle.name())))?;
        let host = self
            .get(host_name)
            .ok_or_else(|| ProviderError::UnknownStore(host_name.to_string()))?;
        let conn = host.open(OpenMode::Write)?;
        let schema = quote_ident(handle.name());
        conn.execute_batch(&format!("VACUUM {schema}; ANALYZE {schema};"))?;
        Ok(())
    }
}
