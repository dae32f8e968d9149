//! Configuration management for the providers and their maintenance service.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable that overrides the configured log level.
const LOG_LEVEL_ENV: &str = "PIM_LOG_LEVEL";

const DEFAULT_PERIOD_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CHARGING_MIN_BATTERY: u8 = 20;
const DEFAULT_DISCHARGING_MIN_BATTERY: u8 = 80;
const DEFAULT_LOCK_LEASE_SECS: u64 = 10 * 60;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Background maintenance settings.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Settings for the maintenance scheduler and upgrade orchestrator.
///
/// Battery thresholds are exclusive lower bounds: maintenance is allowed while
/// charging above `charging_min_battery` percent, or on battery alone above
/// `discharging_min_battery` percent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between periodic maintenance triggers, in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Minimum battery level (exclusive) while charging.
    #[serde(default = "default_charging_min_battery")]
    pub charging_min_battery: u8,
    /// Minimum battery level (exclusive) while not charging.
    #[serde(default = "default_discharging_min_battery")]
    pub discharging_min_battery: u8,
    /// How long a recorded provider lock lease stays valid, in seconds.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

fn default_period_secs() -> u64 {
    DEFAULT_PERIOD_SECS
}

fn default_charging_min_battery() -> u8 {
    DEFAULT_CHARGING_MIN_BATTERY
}

fn default_discharging_min_battery() -> u8 {
    DEFAULT_DISCHARGING_MIN_BATTERY
}

fn default_lock_lease_secs() -> u64 {
    DEFAULT_LOCK_LEASE_SECS
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            period_secs: DEFAULT_PERIOD_SECS,
            charging_min_battery: DEFAULT_CHARGING_MIN_BATTERY,
            discharging_min_battery: DEFAULT_DISCHARGING_MIN_BATTERY,
            lock_lease_secs: DEFAULT_LOCK_LEASE_SECS,
        }
    }
}

impl MaintenanceConfig {
    /// Interval between periodic maintenance triggers.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Validity window of a lock lease.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> CoreResult<()> {
        if self.period_secs == 0 {
            return Err(CoreError::InvalidSetting {
                key: "maintenance.period_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        for (key, value) in [
            ("maintenance.charging_min_battery", self.charging_min_battery),
            ("maintenance.discharging_min_battery", self.discharging_min_battery),
        ] {
            if value > 100 {
                return Err(CoreError::InvalidSetting {
                    key,
                    reason: format!("must be a percentage, got {value}"),
                });
            }
        }
        Ok(())
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.maintenance.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| CoreError::MalformedConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Only the log level can be overridden at runtime.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(LOG_LEVEL_ENV) {
            self.log_level = log_level;
        }
    }
}
