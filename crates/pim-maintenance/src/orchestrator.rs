//! Upgrade orchestration across providers.
//!
//! For each target, strictly one after another:
//!
//! ```text
//! (lease written) → db_lock → db_upgrade → db_unlock → (lease removed)
//! ```
//!
//! `db_unlock` is sent even when the lock or the upgrade failed. A target
//! whose lock another owner holds under an unexpired lease is skipped
//! without any command and counts as failed. The task
//! record is written before the first target and cleared only when every
//! target succeeded, so an interrupted or partial run is retried on the
//! next start.

use std::sync::Arc;
use std::time::Duration;

use pim_provider::{CommandTransport, Method, ResourceAddress};
use tracing::{info, warn};
use uuid::Uuid;

use crate::task_store::{TaskKind, TaskStore};
use crate::wake_lock::WakeLock;
use crate::{MaintenanceError, MaintenanceResult};

/// Outcome for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: ResourceAddress,
    pub locked: bool,
    pub upgraded: bool,
    pub unlocked: bool,
}

impl TargetReport {
    pub fn success(&self) -> bool {
        self.locked && self.upgraded && self.unlocked
    }
}

/// Outcome of one `upgrade_all` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub targets: Vec<TargetReport>,
}

impl UpgradeReport {
    /// Logical AND over every target.
    pub fn success(&self) -> bool {
        self.targets.iter().all(TargetReport::success)
    }

    pub fn failed_targets(&self) -> Vec<&ResourceAddress> {
        self.targets
            .iter()
            .filter(|t| !t.success())
            .map(|t| &t.target)
            .collect()
    }
}

/// Drives the lock protocol to upgrade a list of providers.
pub struct UpgradeOrchestrator {
    transport: Arc<dyn CommandTransport>,
    store: Arc<TaskStore>,
    wake_lock: Arc<WakeLock>,
    lease_ttl: Duration,
    owner: String,
}

impl UpgradeOrchestrator {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        store: Arc<TaskStore>,
        wake_lock: Arc<WakeLock>,
        lease_ttl: Duration,
    ) -> Self {
        let owner = format!("{}:{}", store.scope(), Uuid::new_v4());
        Self {
            transport,
            store,
            wake_lock,
            lease_ttl,
            owner,
        }
    }

    /// Lease owner token of this orchestrator.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Upgrade every target in order.
    ///
    /// Errors only when the task record itself cannot be written or
    /// cleared; per-target failures are reported in the returned report.
    pub fn upgrade_all(&self, targets: &[ResourceAddress]) -> MaintenanceResult<UpgradeReport> {
        self.store.begin(TaskKind::Upgrade, targets)?;

        let report = {
            let _wake = self.wake_lock.acquire();
            UpgradeReport {
                targets: targets.iter().map(|t| self.upgrade_one(t)).collect(),
            }
        };

        if report.success() {
            self.store.clear()?;
            info!(targets = targets.len(), "Upgrade complete");
        } else {
            warn!(
                failed = ?report.failed_targets(),
                "Upgrade incomplete, task record kept for retry"
            );
        }
        Ok(report)
    }

    /// Re-run an interrupted task found in the store.
    ///
    /// Only upgrades can be resumed; any other pending kind is cleared.
    pub fn resume(&self) -> MaintenanceResult<Option<UpgradeReport>> {
        let record = self.store.current()?;
        match record.kind {
            TaskKind::None => Ok(None),
            TaskKind::Upgrade => {
                info!(targets = ?record.targets, "Resuming interrupted upgrade");
                self.upgrade_all(&record.targets).map(Some)
            }
            other => {
                warn!(kind = ?other, "Interrupted task has no resumption routine, clearing");
                self.store.clear()?;
                Ok(None)
            }
        }
    }

    fn upgrade_one(&self, target: &ResourceAddress) -> TargetReport {
        info!(target_address = %target, "Upgrading provider");

        match self.store.acquire_lease(target, &self.owner, self.lease_ttl) {
            Ok(_) => {}
            Err(MaintenanceError::LeaseHeld { owner, .. }) => {
                warn!(target_address = %target, holder = %owner, "Provider lock leased to another owner, skipping");
                return TargetReport {
                    target: target.clone(),
                    locked: false,
                    upgraded: false,
                    unlocked: false,
                };
            }
            Err(e) => warn!(target_address = %target, error = %e, "Could not record lock lease"),
        }

        let locked = self.command(target, &Method::DbLock);

        // An unlocked provider would not apply the upgrade itself.
        let upgraded = locked && self.command(target, &Method::DbUpgrade);

        let unlocked = self.command(target, &Method::DbUnlock);
        if let Err(e) = self.store.release_lease(target) {
            warn!(target_address = %target, error = %e, "Could not remove lock lease");
        }

        let report = TargetReport {
            target: target.clone(),
            locked,
            upgraded,
            unlocked,
        };
        if !report.success() {
            warn!(
                target_address = %target,
                locked,
                upgraded,
                unlocked,
                "Provider upgrade failed"
            );
        }
        report
    }

    fn command(&self, target: &ResourceAddress, method: &Method) -> bool {
        match self.transport.send(target, method, None) {
            Ok(reply) => reply.success,
            Err(e) => {
                warn!(target_address = %target, method = %method, error = %e, "Command delivery failed");
                false
            }
        }
    }
}
