//! # pim-maintenance
//!
//! Background maintenance for the PIM data providers. It drives the
//! provider lock protocol for schema upgrades after an application update
//! and runs periodic vacuum/analyze when the device can afford it.
//!
//! ## Principles
//!
//! - **Upgrades are resumable** - the task record outlives the process until every provider succeeded
//! - **Unlock always follows lock** - a failed upgrade never leaves a provider offline
//! - **Maintenance waits for an idle device** - screen off and enough battery, or the forced fallback a period later
//!
//! ## Architecture
//!
//! ```text
//! PACKAGE REPLACED:
//!   task record → for each provider: db_lock → db_upgrade → db_unlock → clear record
//!
//! PERIODIC:
//!   alarm → gates ─┬─ met   → db_maintenance_start → next alarm
//!                  └─ unmet → listeners + forced fallback alarm
//! ```

pub mod alarm;
pub mod conditions;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod service;
pub mod task_store;
pub mod wake_lock;

#[cfg(test)]
mod tests;

pub use alarm::{Alarm, AlarmClock, AlarmFired, AlarmKey, ManualAlarmClock, TokioAlarmClock};
pub use conditions::{
    BatteryPolicy, BatteryStatus, DeviceConditions, DeviceEvent, GateReport, ListenerKind,
    StaticConditions,
};
pub use error::{MaintenanceError, MaintenanceResult};
pub use orchestrator::{TargetReport, UpgradeOrchestrator, UpgradeReport};
pub use scheduler::{Evaluation, MaintenanceAction, MaintenanceScheduler, ProviderMaintenance};
pub use service::{
    MaintenanceService, MaintenanceServiceBuilder, ServiceEvent, ServiceOutcome, StartReport,
};
pub use task_store::{Lease, TaskKind, TaskRecord, TaskStore};
pub use wake_lock::{WakeLock, WakeLockBackend, WakeLockGuard};
