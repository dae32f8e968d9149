//! Device resource gates for background maintenance.
//!
//! Maintenance runs only while the screen is off and the battery allows it:
//! charging above a low threshold, or on battery alone above a high one.

use std::sync::Mutex;

use pim_config_and_utils::MaintenanceConfig;

/// Battery snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub level_percent: u8,
    pub charging: bool,
}

/// Source of the current device state.
pub trait DeviceConditions: Send + Sync {
    fn battery(&self) -> BatteryStatus;

    fn screen_on(&self) -> bool;
}

/// Battery thresholds (exclusive lower bounds, in percent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryPolicy {
    pub charging_min: u8,
    pub discharging_min: u8,
}

impl Default for BatteryPolicy {
    fn default() -> Self {
        Self::from(&MaintenanceConfig::default())
    }
}

impl From<&MaintenanceConfig> for BatteryPolicy {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            charging_min: config.charging_min_battery,
            discharging_min: config.discharging_min_battery,
        }
    }
}

impl BatteryPolicy {
    pub fn allows(&self, status: BatteryStatus) -> bool {
        if status.charging {
            status.level_percent > self.charging_min
        } else {
            status.level_percent > self.discharging_min
        }
    }
}

/// Signals a deferred evaluation can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKind {
    BatteryChanged,
    ScreenOff,
}

/// A device signal delivered to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    BatteryChanged(BatteryStatus),
    ScreenOff,
    ScreenOn,
}

impl DeviceEvent {
    /// The listener this event answers, if any.
    pub fn listener(&self) -> Option<ListenerKind> {
        match self {
            Self::BatteryChanged(_) => Some(ListenerKind::BatteryChanged),
            Self::ScreenOff => Some(ListenerKind::ScreenOff),
            Self::ScreenOn => None,
        }
    }
}

/// Outcome of evaluating both gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateReport {
    pub screen_off: bool,
    pub battery_ok: bool,
}

impl GateReport {
    pub fn evaluate(policy: &BatteryPolicy, battery: BatteryStatus, screen_on: bool) -> Self {
        Self {
            screen_off: !screen_on,
            battery_ok: policy.allows(battery),
        }
    }

    pub fn satisfied(&self) -> bool {
        self.screen_off && self.battery_ok
    }

    /// Listeners to register for the gates that failed.
    pub fn unmet(&self) -> Vec<ListenerKind> {
        let mut unmet = Vec::new();
        if !self.battery_ok {
            unmet.push(ListenerKind::BatteryChanged);
        }
        if !self.screen_off {
            unmet.push(ListenerKind::ScreenOff);
        }
        unmet
    }
}

/// Settable device state for tests and simulations.
#[derive(Debug)]
pub struct StaticConditions {
    state: Mutex<(BatteryStatus, bool)>,
}

impl StaticConditions {
    pub fn new(level_percent: u8, charging: bool, screen_on: bool) -> Self {
        Self {
            state: Mutex::new((
                BatteryStatus {
                    level_percent,
                    charging,
                },
                screen_on,
            )),
        }
    }

    pub fn set_battery(&self, level_percent: u8, charging: bool) {
        self.state.lock().expect("lock poisoned").0 = BatteryStatus {
            level_percent,
            charging,
        };
    }

    pub fn set_screen_on(&self, screen_on: bool) {
        self.state.lock().expect("lock poisoned").1 = screen_on;
    }
}

impl DeviceConditions for StaticConditions {
    fn battery(&self) -> BatteryStatus {
        self.state.lock().expect("lock poisoned").0
    }

    fn screen_on(&self) -> bool {
        self.state.lock().expect("lock poisoned").1
    }
}
