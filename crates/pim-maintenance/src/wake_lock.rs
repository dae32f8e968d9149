//! Reference-counted wake lock.
//!
//! Held for the duration of one maintenance task so the device does not
//! suspend mid-task. Released by the guard's `Drop`, so early returns and
//! panics release it too.

use std::sync::{Arc, Mutex};

use tracing::debug;

/// Platform hook notified when the lock becomes held (0 → 1) and free (1 → 0).
pub trait WakeLockBackend: Send + Sync {
    fn acquire(&self, tag: &str);

    fn release(&self, tag: &str);
}

/// Counting wake lock.
pub struct WakeLock {
    tag: String,
    count: Mutex<usize>,
    backend: Option<Arc<dyn WakeLockBackend>>,
}

impl std::fmt::Debug for WakeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLock")
            .field("tag", &self.tag)
            .field("held", &self.held())
            .finish()
    }
}

impl WakeLock {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            count: Mutex::new(0),
            backend: None,
        }
    }

    pub fn with_backend(tag: impl Into<String>, backend: Arc<dyn WakeLockBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(tag)
        }
    }

    pub fn acquire(&self) -> WakeLockGuard<'_> {
        let mut count = self.count.lock().expect("lock poisoned");
        *count += 1;
        if *count == 1 {
            debug!(tag = %self.tag, "Wake lock acquired");
            if let Some(backend) = &self.backend {
                backend.acquire(&self.tag);
            }
        }
        WakeLockGuard { lock: self }
    }

    /// Number of outstanding guards.
    pub fn held(&self) -> usize {
        *self.count.lock().expect("lock poisoned")
    }

    pub fn is_held(&self) -> bool {
        self.held() > 0
    }

    fn release(&self) {
        let mut count = self.count.lock().expect("lock poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            debug!(tag = %self.tag, "Wake lock released");
            if let Some(backend) = &self.backend {
                backend.release(&self.tag);
            }
        }
    }
}

/// Keeps the wake lock held until dropped.
#[must_use = "the wake lock is released when the guard is dropped"]
pub struct WakeLockGuard<'a> {
    lock: &'a WakeLock,
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
