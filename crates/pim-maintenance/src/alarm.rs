//! Scheduled triggers.
//!
//! One alarm exists per (owner, target) pair. Scheduling an alarm for a key
//! that already has one replaces it. A fired alarm carries its `forced`
//! flag, which makes the next evaluation skip the condition gates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pim_provider::ResourceAddress;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{MaintenanceError, MaintenanceResult};

/// Identity of an alarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmKey {
    pub owner: String,
    pub target: ResourceAddress,
}

impl AlarmKey {
    pub fn new(owner: impl Into<String>, target: impl Into<ResourceAddress>) -> Self {
        Self {
            owner: owner.into(),
            target: target.into(),
        }
    }
}

/// A trigger to deliver after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub key: AlarmKey,
    pub delay: Duration,
    pub forced: bool,
}

/// Delivered when an alarm goes off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmFired {
    pub key: AlarmKey,
    pub forced: bool,
}

/// Schedules deferred triggers.
pub trait AlarmClock: Send + Sync {
    /// Arm `alarm`, replacing any alarm with the same key.
    fn schedule(&self, alarm: Alarm);

    /// Disarm the alarm for `key`. Returns whether one was armed.
    fn cancel(&self, key: &AlarmKey) -> bool;

    fn is_scheduled(&self, key: &AlarmKey) -> bool;
}

type ArmedTasks = Arc<Mutex<HashMap<AlarmKey, (u64, JoinHandle<()>)>>>;

/// Alarms backed by Tokio timers; fired alarms are sent on a channel.
pub struct TokioAlarmClock {
    runtime: Handle,
    sender: UnboundedSender<AlarmFired>,
    armed: ArmedTasks,
    generation: Mutex<u64>,
}

impl TokioAlarmClock {
    /// Must be created from within a Tokio runtime.
    pub fn new(sender: UnboundedSender<AlarmFired>) -> MaintenanceResult<Self> {
        let runtime = Handle::try_current().map_err(|e| MaintenanceError::Task(e.to_string()))?;
        Ok(Self {
            runtime,
            sender,
            armed: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        })
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock().expect("lock poisoned");
        *generation += 1;
        *generation
    }
}

impl AlarmClock for TokioAlarmClock {
    fn schedule(&self, alarm: Alarm) {
        let generation = self.next_generation();
        let armed = self.armed.clone();
        let sender = self.sender.clone();
        let key = alarm.key.clone();

        // Hold the map while spawning so the task cannot remove itself first.
        let mut tasks = self.armed.lock().expect("lock poisoned");
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(alarm.delay).await;
            let mut tasks = armed.lock().expect("lock poisoned");
            if !matches!(tasks.get(&alarm.key), Some((g, _)) if *g == generation) {
                debug!(owner = %alarm.key.owner, target = %alarm.key.target, "Replaced alarm woke up, dropping");
                return;
            }
            tasks.remove(&alarm.key);
            let fired = AlarmFired {
                key: alarm.key,
                forced: alarm.forced,
            };
            if sender.send(fired).is_err() {
                warn!("Alarm fired after the receiver was dropped");
            }
        });

        debug!(owner = %key.owner, target = %key.target, "Alarm armed");
        if let Some((_, previous)) = tasks.insert(key, (generation, task)) {
            previous.abort();
        }
    }

    fn cancel(&self, key: &AlarmKey) -> bool {
        match self.armed.lock().expect("lock poisoned").remove(key) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn is_scheduled(&self, key: &AlarmKey) -> bool {
        self.armed.lock().expect("lock poisoned").contains_key(key)
    }
}

impl Drop for TokioAlarmClock {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.armed.lock() {
            for (_, (_, task)) in tasks.drain() {
                task.abort();
            }
        }
    }
}

/// Alarm clock driven by hand, for tests.
#[derive(Debug, Default)]
pub struct ManualAlarmClock {
    alarms: Mutex<BTreeMap<AlarmKey, Alarm>>,
}

impl ManualAlarmClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &AlarmKey) -> Option<Alarm> {
        self.alarms.lock().expect("lock poisoned").get(key).cloned()
    }

    /// Every armed alarm, ordered by key.
    pub fn scheduled(&self) -> Vec<Alarm> {
        self.alarms.lock().expect("lock poisoned").values().cloned().collect()
    }

    /// Fire the alarm for `key`, disarming it.
    pub fn fire(&self, key: &AlarmKey) -> Option<AlarmFired> {
        self.alarms
            .lock()
            .expect("lock poisoned")
            .remove(key)
            .map(|alarm| AlarmFired {
                key: alarm.key,
                forced: alarm.forced,
            })
    }
}

impl AlarmClock for ManualAlarmClock {
    fn schedule(&self, alarm: Alarm) {
        self.alarms
            .lock()
            .expect("lock poisoned")
            .insert(alarm.key.clone(), alarm);
    }

    fn cancel(&self, key: &AlarmKey) -> bool {
        self.alarms.lock().expect("lock poisoned").remove(key).is_some()
    }

    fn is_scheduled(&self, key: &AlarmKey) -> bool {
        self.alarms.lock().expect("lock poisoned").contains_key(key)
    }
}
