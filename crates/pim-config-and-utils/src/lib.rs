//! Core configuration and utilities for the PIM data providers.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, MaintenanceConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
