//! The maintenance service: one orchestrator, one scheduler per provider,
//! and the event loop that feeds them.
//!
//! # Startup
//!
//! 1. Unlock providers named by expired or own leftover lock leases
//! 2. Resume an interrupted task from the task record
//! 3. Arm the periodic alarm of every maintained provider
//!
//! Events are handled one at a time on the blocking pool, so upgrades and
//! maintenance passes never overlap.

use std::sync::Arc;

use pim_config_and_utils::{init_logging, Config, MaintenanceConfig, Paths};
use pim_provider::{CommandTransport, Method, ResourceAddress};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::alarm::{AlarmClock, AlarmFired, AlarmKey};
use crate::conditions::{BatteryPolicy, DeviceConditions, DeviceEvent};
use crate::orchestrator::{UpgradeOrchestrator, UpgradeReport};
use crate::scheduler::{Evaluation, MaintenanceAction, MaintenanceScheduler, ProviderMaintenance};
use crate::task_store::{Lease, TaskStore};
use crate::wake_lock::WakeLock;
use crate::{MaintenanceError, MaintenanceResult};

const DEFAULT_WAKE_LOCK_TAG: &str = "pim-maintenance";

/// Inputs to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The application was replaced; upgrade these providers.
    PackageReplaced { targets: Vec<ResourceAddress> },
    AlarmFired(AlarmFired),
    Device(DeviceEvent),
}

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    Upgraded(UpgradeReport),
    /// Scheduler evaluations triggered by the event.
    Evaluated(Vec<(ResourceAddress, Evaluation)>),
    Ignored,
}

/// What `start` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub leftover_leases: Vec<Lease>,
    pub resumed: Option<UpgradeReport>,
}

pub struct MaintenanceServiceBuilder {
    config: MaintenanceConfig,
    store: Arc<TaskStore>,
    transport: Arc<dyn CommandTransport>,
    clock: Option<Arc<dyn AlarmClock>>,
    conditions: Option<Arc<dyn DeviceConditions>>,
    wake_lock: Option<Arc<WakeLock>>,
    action: Option<Arc<dyn MaintenanceAction>>,
    targets: Vec<ResourceAddress>,
}

impl MaintenanceServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn AlarmClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn conditions(mut self, conditions: Arc<dyn DeviceConditions>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn wake_lock(mut self, wake_lock: Arc<WakeLock>) -> Self {
        self.wake_lock = Some(wake_lock);
        self
    }

    /// Replace the default `db_maintenance_start` action.
    pub fn action(mut self, action: Arc<dyn MaintenanceAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Schedule periodic maintenance for `target`.
    pub fn maintain(mut self, target: impl Into<ResourceAddress>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn build(self) -> MaintenanceResult<MaintenanceService> {
        self.config.validate()?;
        let clock = self
            .clock
            .ok_or_else(|| MaintenanceError::InvalidState("no alarm clock configured".to_string()))?;
        let conditions = self.conditions.ok_or_else(|| {
            MaintenanceError::InvalidState("no device conditions configured".to_string())
        })?;
        let wake_lock = self
            .wake_lock
            .unwrap_or_else(|| Arc::new(WakeLock::new(DEFAULT_WAKE_LOCK_TAG)));
        let action = self
            .action
            .unwrap_or_else(|| Arc::new(ProviderMaintenance::new(self.transport.clone())));

        let policy = BatteryPolicy::from(&self.config);
        let schedulers = self
            .targets
            .into_iter()
            .map(|target| {
                MaintenanceScheduler::new(
                    AlarmKey::new(self.store.scope(), target),
                    self.config.period(),
                    policy,
                    conditions.clone(),
                    clock.clone(),
                    action.clone(),
                    wake_lock.clone(),
                )
            })
            .collect();

        let orchestrator = UpgradeOrchestrator::new(
            self.transport.clone(),
            self.store.clone(),
            wake_lock.clone(),
            self.config.lock_lease(),
        );

        Ok(MaintenanceService {
            orchestrator,
            schedulers,
            store: self.store,
            transport: self.transport,
            wake_lock,
        })
    }
}

/// Background maintenance for a set of providers.
pub struct MaintenanceService {
    orchestrator: UpgradeOrchestrator,
    schedulers: Vec<MaintenanceScheduler>,
    store: Arc<TaskStore>,
    transport: Arc<dyn CommandTransport>,
    wake_lock: Arc<WakeLock>,
}

impl MaintenanceService {
    pub fn builder(
        config: MaintenanceConfig,
        store: Arc<TaskStore>,
        transport: Arc<dyn CommandTransport>,
    ) -> MaintenanceServiceBuilder {
        MaintenanceServiceBuilder {
            config,
            store,
            transport,
            clock: None,
            conditions: None,
            wake_lock: None,
            action: None,
            targets: Vec::new(),
        }
    }

    /// Builder wired to the on-disk layout under `paths`: loads the config
    /// file, installs logging and opens the state database.
    pub fn builder_from_paths(
        paths: &Paths,
        scope: &str,
        transport: Arc<dyn CommandTransport>,
    ) -> MaintenanceResult<MaintenanceServiceBuilder> {
        paths.ensure_dirs()?;
        let config = Config::load(paths)?;
        init_logging(&config.log_level);

        let store = TaskStore::open(&paths.state_database_file(), scope)?;
        info!(scope, path = %paths.state_database_file().display(), "Maintenance state opened");
        Ok(Self::builder(config.maintenance, Arc::new(store), transport))
    }

    pub fn orchestrator(&self) -> &UpgradeOrchestrator {
        &self.orchestrator
    }

    pub fn schedulers(&self) -> &[MaintenanceScheduler] {
        &self.schedulers
    }

    pub fn scheduler(&self, target: &ResourceAddress) -> Option<&MaintenanceScheduler> {
        self.schedulers.iter().find(|s| s.target() == target)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn wake_lock(&self) -> &WakeLock {
        &self.wake_lock
    }

    /// Recover from the previous run and arm the alarms.
    pub fn start(&self) -> MaintenanceResult<StartReport> {
        let leftover_leases = self
            .store
            .clear_leftover_leases(self.orchestrator.owner())?;
        for lease in &leftover_leases {
            // The provider process may have outlived the previous run.
            match self.transport.send(&lease.target, &Method::DbUnlock, None) {
                Ok(reply) if reply.success => {
                    info!(target_address = %lease.target, "Unlocked provider left locked by an interrupted run")
                }
                Ok(_) => warn!(target_address = %lease.target, "Provider refused unlock"),
                Err(e) => warn!(target_address = %lease.target, error = %e, "Could not unlock provider"),
            }
        }

        let resumed = self.orchestrator.resume()?;

        for scheduler in &self.schedulers {
            scheduler.arm();
        }
        info!(
            providers = self.schedulers.len(),
            resumed = resumed.is_some(),
            "Maintenance service started"
        );

        Ok(StartReport {
            leftover_leases,
            resumed,
        })
    }

    /// Handle one event synchronously.
    pub fn handle(&self, event: ServiceEvent) -> MaintenanceResult<ServiceOutcome> {
        match event {
            ServiceEvent::PackageReplaced { targets } => {
                info!(targets = ?targets, "Package replaced");
                Ok(ServiceOutcome::Upgraded(self.orchestrator.upgrade_all(&targets)?))
            }
            ServiceEvent::AlarmFired(fired) => {
                let evaluations: Vec<_> = self
                    .schedulers
                    .iter()
                    .filter_map(|s| s.handle_alarm(&fired).map(|e| (s.target().clone(), e)))
                    .collect();
                if evaluations.is_empty() {
                    debug!(owner = %fired.key.owner, target_address = %fired.key.target, "Alarm for unknown scheduler");
                    return Ok(ServiceOutcome::Ignored);
                }
                Ok(ServiceOutcome::Evaluated(evaluations))
            }
            ServiceEvent::Device(device) => {
                let evaluations: Vec<_> = self
                    .schedulers
                    .iter()
                    .filter_map(|s| s.handle_event(device).map(|e| (s.target().clone(), e)))
                    .collect();
                if evaluations.is_empty() {
                    return Ok(ServiceOutcome::Ignored);
                }
                Ok(ServiceOutcome::Evaluated(evaluations))
            }
        }
    }

    /// Run the service until `shutdown` fires or both channels close.
    ///
    /// `start` runs first. Each event is handled on the blocking pool and
    /// awaited before the next one is taken.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ServiceEvent>,
        mut alarms: mpsc::UnboundedReceiver<AlarmFired>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> MaintenanceResult<()> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.start())
            .await
            .map_err(|e| MaintenanceError::Task(e.to_string()))??;

        let mut events_open = true;
        let mut alarms_open = true;
        while events_open || alarms_open {
            let event = tokio::select! {
                _ = &mut shutdown => {
                    info!("Maintenance service received shutdown signal");
                    break;
                }
                received = events.recv(), if events_open => match received {
                    Some(event) => event,
                    None => {
                        debug!("Event channel closed");
                        events_open = false;
                        continue;
                    }
                },
                received = alarms.recv(), if alarms_open => match received {
                    Some(fired) => ServiceEvent::AlarmFired(fired),
                    None => {
                        debug!("Alarm channel closed");
                        alarms_open = false;
                        continue;
                    }
                },
            };

            let service = self.clone();
            match tokio::task::spawn_blocking(move || service.handle(event)).await {
                Ok(Ok(outcome)) => debug!(outcome = ?outcome, "Maintenance event handled"),
                Ok(Err(e)) => warn!(error = %e, "Maintenance event failed"),
                Err(e) => return Err(MaintenanceError::Task(e.to_string())),
            }
        }

        debug!("Maintenance service loop stopped");
        Ok(())
    }
}
