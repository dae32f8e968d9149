//! Maintenance error types.

use pim_provider::ProviderError;
use thiserror::Error;

/// Maintenance error type.
#[derive(Error, Debug)]
pub enum MaintenanceError {
    /// SQLite error in the task store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON error in a persisted value
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] pim_config_and_utils::CoreError),

    /// Persisted state that cannot be interpreted
    #[error("Invalid maintenance state: {0}")]
    InvalidState(String),

    /// Another owner holds an unexpired lease on the provider lock
    #[error("Lease on {target} held by {owner}")]
    LeaseHeld { target: String, owner: String },

    /// The service loop stopped while work was pending
    #[error("Maintenance task failed: {0}")]
    Task(String),
}

/// Result type alias using MaintenanceError.
pub type MaintenanceResult<T> = Result<T, MaintenanceError>;
