//! Change notifications.
//!
//! Providers signal that an addressed resource changed. Single operations
//! notify immediately after their statement succeeds; batches collect
//! targets in a [`NotificationBuffer`] and flush it only after every
//! transaction of the batch has committed.
//!
//! Duplicates are preserved: a batch that touches `A, B, A` delivers three
//! notifications in that order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, RwLock};

use crate::types::ResourceAddress;

/// Receives change notifications from a provider.
///
/// Called after the change has been committed.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, target: &ResourceAddress);
}

/// Discards every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ChangeObserver for NullObserver {
    fn on_change(&self, _target: &ResourceAddress) {}
}

/// Records every notification in delivery order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    changes: Mutex<Vec<ResourceAddress>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded notifications.
    pub fn changes(&self) -> Vec<ResourceAddress> {
        self.changes.lock().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.changes.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.changes.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeObserver for RecordingObserver {
    fn on_change(&self, target: &ResourceAddress) {
        self.changes.lock().expect("lock poisoned").push(target.clone());
    }
}

/// A subscription to every change delivered through a [`NotificationHub`].
pub struct ChangeSubscription {
    receiver: Receiver<ResourceAddress>,
}

impl ChangeSubscription {
    /// Blocks until the next change arrives; `None` once the hub is gone.
    pub fn recv(&self) -> Option<ResourceAddress> {
        self.receiver.recv().ok()
    }

    /// Returns the next queued change without blocking.
    pub fn try_recv(&self) -> Option<ResourceAddress> {
        self.receiver.try_recv().ok()
    }

    /// Drains the changes queued so far.
    pub fn drain(&self) -> Vec<ResourceAddress> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Blocking iterator that ends when the hub is dropped.
    pub fn iter(&self) -> impl Iterator<Item = ResourceAddress> + '_ {
        std::iter::from_fn(|| self.recv())
    }
}

/// Fans notifications out to channel subscribers.
///
/// Delivery means the address was enqueued on each subscriber's channel;
/// subscribers consume at their own pace.
#[derive(Debug, Default)]
pub struct NotificationHub {
    subscribers: RwLock<Vec<Sender<ResourceAddress>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes delivered after this call.
    pub fn subscribe(&self) -> ChangeSubscription {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.write().expect("lock poisoned").push(sender);
        ChangeSubscription { receiver }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }
}

impl ChangeObserver for NotificationHub {
    fn on_change(&self, target: &ResourceAddress) {
        // Dropped receivers are pruned on send.
        let mut subscribers = self.subscribers.write().expect("lock poisoned");
        subscribers.retain(|sender| sender.send(target.clone()).is_ok());
    }
}

/// Pending notifications of one in-flight batch.
#[derive(Debug, Default)]
pub struct NotificationBuffer {
    pending: Vec<ResourceAddress>,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: ResourceAddress) {
        self.pending.push(target);
    }

    /// Deliver every pending notification in recording order.
    ///
    /// Returns the number delivered.
    pub fn flush_all<O: ChangeObserver + ?Sized>(&mut self, observer: &O) -> usize {
        let pending = std::mem::take(&mut self.pending);
        for target in &pending {
            observer.on_change(target);
        }
        pending.len()
    }

    /// Drop every pending notification without delivering it.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> &[ResourceAddress] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
