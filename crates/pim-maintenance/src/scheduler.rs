//! Condition-gated periodic maintenance for one provider.
//!
//! ```text
//! trigger(forced) ─┬─ forced ─────────────────────────────┐
//!                  └─ gates: screen off AND battery ok ─┬─┤
//!                                                       │ └→ run (wake lock held)
//!                                                       │      → clear listeners
//!                                                       │      → periodic alarm +1 period
//!                                                       └→ listeners for unmet gates
//!                                                            → forced alarm +1 period
//! ```
//!
//! The forced fallback alarm guarantees maintenance eventually runs even
//! if every listener callback is lost.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pim_provider::{CommandTransport, Method, ResourceAddress};
use tracing::{debug, info, warn};

use crate::alarm::{Alarm, AlarmClock, AlarmFired, AlarmKey};
use crate::conditions::{BatteryPolicy, DeviceConditions, DeviceEvent, GateReport, ListenerKind};
use crate::wake_lock::WakeLock;

/// The maintenance work itself.
pub trait MaintenanceAction: Send + Sync {
    /// Run maintenance on `target`; `true` when every store succeeded.
    fn run(&self, target: &ResourceAddress) -> bool;
}

/// Sends `db_maintenance_start` to the provider.
pub struct ProviderMaintenance {
    transport: Arc<dyn CommandTransport>,
}

impl ProviderMaintenance {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }
}

impl MaintenanceAction for ProviderMaintenance {
    fn run(&self, target: &ResourceAddress) -> bool {
        match self.transport.send(target, &Method::DbMaintenanceStart, None) {
            Ok(reply) => reply.success,
            Err(e) => {
                warn!(target_address = %target, error = %e, "Maintenance command failed");
                false
            }
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Maintenance ran.
    Ran { success: bool },
    /// Conditions unmet; waiting on these listeners.
    Deferred { listeners: Vec<ListenerKind> },
}

/// Scheduler for one maintained provider.
pub struct MaintenanceScheduler {
    key: AlarmKey,
    period: Duration,
    policy: BatteryPolicy,
    conditions: Arc<dyn DeviceConditions>,
    clock: Arc<dyn AlarmClock>,
    action: Arc<dyn MaintenanceAction>,
    wake_lock: Arc<WakeLock>,
    listeners: Mutex<BTreeSet<ListenerKind>>,
    runs: AtomicU64,
}

impl MaintenanceScheduler {
    pub fn new(
        key: AlarmKey,
        period: Duration,
        policy: BatteryPolicy,
        conditions: Arc<dyn DeviceConditions>,
        clock: Arc<dyn AlarmClock>,
        action: Arc<dyn MaintenanceAction>,
        wake_lock: Arc<WakeLock>,
    ) -> Self {
        Self {
            key,
            period,
            policy,
            conditions,
            clock,
            action,
            wake_lock,
            listeners: Mutex::new(BTreeSet::new()),
            runs: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &AlarmKey {
        &self.key
    }

    pub fn target(&self) -> &ResourceAddress {
        &self.key.target
    }

    /// Number of times maintenance has run.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Listeners currently registered.
    pub fn registered_listeners(&self) -> Vec<ListenerKind> {
        self.listeners
            .lock()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn is_task_scheduled(&self) -> bool {
        self.clock.is_scheduled(&self.key)
    }

    /// Disarm the alarm and drop any listeners.
    pub fn cancel_task(&self) {
        self.clock.cancel(&self.key);
        self.listeners.lock().expect("lock poisoned").clear();
        debug!(target_address = %self.key.target, "Maintenance task cancelled");
    }

    /// Arm the periodic alarm unless one is already armed.
    pub fn arm(&self) {
        if !self.is_task_scheduled() {
            self.schedule(false);
        }
    }

    /// Run now if forced or if the device allows it; otherwise wait.
    pub fn evaluate_and_maybe_run(&self, forced: bool) -> Evaluation {
        if forced {
            debug!(target_address = %self.key.target, "Forced maintenance trigger");
            return self.run();
        }

        let report = GateReport::evaluate(
            &self.policy,
            self.conditions.battery(),
            self.conditions.screen_on(),
        );
        if report.satisfied() {
            return self.run();
        }

        let listeners = self.register(&report);
        // Fallback in case no listener ever fires.
        self.schedule(true);
        info!(
            target_address = %self.key.target,
            screen_off = report.screen_off,
            battery_ok = report.battery_ok,
            "Maintenance deferred until conditions are met"
        );
        Evaluation::Deferred { listeners }
    }

    /// Deliver a device signal. `None` when no listener is waiting for it.
    pub fn handle_event(&self, event: DeviceEvent) -> Option<Evaluation> {
        let listener = event.listener()?;
        if !self
            .listeners
            .lock()
            .expect("lock poisoned")
            .contains(&listener)
        {
            return None;
        }

        let battery = match event {
            DeviceEvent::BatteryChanged(status) => status,
            _ => self.conditions.battery(),
        };
        let screen_on = match event {
            DeviceEvent::ScreenOff => false,
            _ => self.conditions.screen_on(),
        };

        let report = GateReport::evaluate(&self.policy, battery, screen_on);
        if report.satisfied() {
            return Some(self.run());
        }
        // The fallback alarm stays where it is.
        Some(Evaluation::Deferred {
            listeners: self.register(&report),
        })
    }

    /// Deliver a fired alarm. `None` when it belongs to another scheduler.
    pub fn handle_alarm(&self, fired: &AlarmFired) -> Option<Evaluation> {
        if fired.key != self.key {
            return None;
        }
        Some(self.evaluate_and_maybe_run(fired.forced))
    }

    fn run(&self) -> Evaluation {
        self.listeners.lock().expect("lock poisoned").clear();

        let success = {
            let _wake = self.wake_lock.acquire();
            self.action.run(&self.key.target)
        };
        self.runs.fetch_add(1, Ordering::SeqCst);

        if success {
            info!(target_address = %self.key.target, "Maintenance complete");
        } else {
            warn!(target_address = %self.key.target, "Maintenance failed");
        }

        // Next periodic run regardless of outcome.
        self.schedule(false);
        Evaluation::Ran { success }
    }

    fn register(&self, report: &GateReport) -> Vec<ListenerKind> {
        let unmet = report.unmet();
        let mut listeners = self.listeners.lock().expect("lock poisoned");
        listeners.clear();
        listeners.extend(unmet.iter().copied());
        unmet
    }

    fn schedule(&self, forced: bool) {
        self.clock.schedule(Alarm {
            key: self.key.clone(),
            delay: self.period,
            forced,
        });
    }
}
