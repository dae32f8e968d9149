//! The cooperative maintenance lock.
//!
//! One lock exists per provider class and is shared by every instance of
//! that class in the process. While it is held, providers reject all
//! traffic except `db_unlock` and `db_upgrade`, and touch no database.
//!
//! The flag lives in memory only: a process that dies while locked comes
//! back unlocked. Any caller may unlock; there is no ownership token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::command::Method;

/// Observable lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Process-local lock for one provider class.
#[derive(Debug)]
pub struct ProviderLock {
    class: String,
    locked: AtomicBool,
}

impl ProviderLock {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            locked: AtomicBool::new(false),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Move to `Locked`. Returns whether the state changed.
    pub fn lock(&self) -> bool {
        let changed = !self.locked.swap(true, Ordering::SeqCst);
        if changed {
            info!(provider = %self.class, "Provider locked");
        }
        changed
    }

    /// Move to `Unlocked`. Returns whether the state changed.
    pub fn unlock(&self) -> bool {
        let changed = self.locked.swap(false, Ordering::SeqCst);
        if changed {
            info!(provider = %self.class, "Provider unlocked");
        }
        changed
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LockState {
        if self.is_locked() {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    /// Whether `method` may proceed in the current state.
    pub fn admits(&self, method: &Method) -> bool {
        !self.is_locked() || matches!(method, Method::DbUpgrade | Method::DbUnlock)
    }
}

/// Hands out one shared [`ProviderLock`] per provider class.
///
/// Inject one registry per process; tests build a fresh one each.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<ProviderLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `class`, created unlocked on first use.
    pub fn lock_for(&self, class: &str) -> Arc<ProviderLock> {
        self.locks
            .lock()
            .expect("lock poisoned")
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(ProviderLock::new(class)))
            .clone()
    }

    /// Classes currently locked.
    pub fn locked_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .locks
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|l| l.is_locked())
            .map(|l| l.class().to_string())
            .collect();
        classes.sort();
        classes
    }
}
