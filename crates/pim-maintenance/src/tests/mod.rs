//! Scenario tests for background maintenance.
//!
//! - `upgrade.rs`      - lock protocol ordering and partial failure
//! - `resume.rs`       - interrupted tasks and leftover leases at startup
//! - `deferral.rs`     - condition gates, listeners and the forced fallback
//! - `service_loop.rs` - the async event loop with real timers
//! - `end_to_end.rs`   - the service driving real SQLite providers

mod deferral;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use pim_config_and_utils::MaintenanceConfig;
use pim_provider::{
    CommandReply, CommandTransport, Method, ProviderError, ProviderResult, ResourceAddress,
};
use serde_json::Value;

use crate::{
    AlarmClock, DeviceConditions, MaintenanceService, StaticConditions, TaskStore,
    UpgradeOrchestrator, WakeLock,
};

pub(crate) const SCOPE: &str = "maintenance";

/// Transport that records every command and fails the scripted ones.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    calls: Mutex<Vec<(String, String)>>,
    failing: Mutex<BTreeSet<(String, String)>>,
    unreachable: Mutex<BTreeSet<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply `success: false` to `method` on `target`.
    pub fn fail(&self, target: &str, method: Method) {
        self.failing
            .lock()
            .unwrap()
            .insert((target.to_string(), method.as_str().to_string()));
    }

    /// Return a transport error for every command to `target`.
    pub fn unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Methods sent to `target`, in order.
    pub fn methods_for(&self, target: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(t, _)| t == target)
            .map(|(_, m)| m)
            .collect()
    }
}

impl CommandTransport for ScriptedTransport {
    fn send(
        &self,
        target: &ResourceAddress,
        method: &Method,
        _arg: Option<&Value>,
    ) -> ProviderResult<CommandReply> {
        let call = (target.to_string(), method.as_str().to_string());
        self.calls.lock().unwrap().push(call.clone());

        if self.unreachable.lock().unwrap().contains(&call.0) {
            return Err(ProviderError::UnknownAddress(call.0));
        }
        let failed = self.failing.lock().unwrap().contains(&call);
        Ok(CommandReply::from_success(!failed))
    }
}

pub(crate) fn addresses(list: &[&str]) -> Vec<ResourceAddress> {
    list.iter().map(|a| ResourceAddress::from_string(*a)).collect()
}

pub(crate) fn lock_protocol() -> Vec<String> {
    vec![
        "db_lock".to_string(),
        "db_upgrade".to_string(),
        "db_unlock".to_string(),
    ]
}

pub(crate) fn orchestrator(
    transport: Arc<ScriptedTransport>,
    store: Arc<TaskStore>,
) -> UpgradeOrchestrator {
    UpgradeOrchestrator::new(
        transport,
        store,
        Arc::new(WakeLock::new("test")),
        MaintenanceConfig::default().lock_lease(),
    )
}

/// Service maintaining `targets` with the given clock and device state.
pub(crate) fn service(
    transport: Arc<ScriptedTransport>,
    store: Arc<TaskStore>,
    clock: Arc<dyn AlarmClock>,
    conditions: Arc<StaticConditions>,
    targets: &[&str],
) -> MaintenanceService {
    let conditions: Arc<dyn DeviceConditions> = conditions;
    let mut builder = MaintenanceService::builder(MaintenanceConfig::default(), store, transport)
        .clock(clock)
        .conditions(conditions);
    for target in targets {
        builder = builder.maintain(*target);
    }
    builder.build().unwrap()
}

#[test]
fn builder_requires_clock_and_conditions() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(TaskStore::in_memory(SCOPE).unwrap());

    let missing_clock = MaintenanceService::builder(
        MaintenanceConfig::default(),
        store.clone(),
        transport.clone(),
    )
    .conditions(Arc::new(StaticConditions::new(100, true, false)))
    .build();
    assert!(matches!(missing_clock, Err(crate::MaintenanceError::InvalidState(_))));

    let missing_conditions =
        MaintenanceService::builder(MaintenanceConfig::default(), store, transport)
            .clock(Arc::new(crate::ManualAlarmClock::new()))
            .build();
    assert!(matches!(missing_conditions, Err(crate::MaintenanceError::InvalidState(_))));
}

#[test]
fn builder_rejects_invalid_config() {
    let config = MaintenanceConfig {
        period_secs: 0,
        ..MaintenanceConfig::default()
    };
    let result = MaintenanceService::builder(
        config,
        Arc::new(TaskStore::in_memory(SCOPE).unwrap()),
        ScriptedTransport::new(),
    )
    .clock(Arc::new(crate::ManualAlarmClock::new()))
    .conditions(Arc::new(StaticConditions::new(100, true, false)))
    .build();

    assert!(matches!(result, Err(crate::MaintenanceError::Config(_))));
}

#[test]
fn builder_from_paths_uses_config_file_and_state_database() {
    let dir = tempfile::tempdir().unwrap();
    let paths = pim_config_and_utils::Paths::with_base_dir(dir.path().join("pimstore"));
    paths.ensure_dirs().unwrap();
    std::fs::write(
        paths.config_file(),
        r#"{ "maintenance": { "period_secs": 3600 } }"#,
    )
    .unwrap();

    let clock = Arc::new(crate::ManualAlarmClock::new());
    let service = MaintenanceService::builder_from_paths(&paths, SCOPE, ScriptedTransport::new())
        .unwrap()
        .clock(clock.clone())
        .conditions(Arc::new(StaticConditions::new(100, true, false)))
        .maintain("contacts")
        .build()
        .unwrap();
    service.start().unwrap();

    assert!(paths.state_database_file().exists());
    assert_eq!(
        clock.get(&crate::AlarmKey::new(SCOPE, "contacts")).unwrap().delay,
        std::time::Duration::from_secs(3600)
    );
}
