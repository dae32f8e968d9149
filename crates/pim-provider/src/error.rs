//! Provider error types.

use thiserror::Error;

/// Provider error type.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No route matches the resource address
    #[error("No route for resource address: {0}")]
    UnknownAddress(String),

    /// A route or attachment names a store that was never declared
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    /// Invalid store set or route configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The database file was written by a newer schema than this build supports
    #[error("Store {store} is at schema version {found}, newer than supported version {supported}")]
    Downgrade {
        store: String,
        found: u32,
        supported: u32,
    },

    /// Malformed operation (empty update, bad identifier, bad ordering)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A batch operation failed and every transaction of the batch was rolled back
    #[error("Batch rolled back after {completed} operation(s): {source}")]
    Apply {
        completed: usize,
        #[source]
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Wrap an error raised inside a batch.
    pub(crate) fn apply(completed: usize, source: ProviderError) -> Self {
        Self::Apply {
            completed,
            source: Box::new(source),
        }
    }

    /// Whether this is a database open/read/write failure that a later
    /// maintenance tick may succeed at.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(_) | Self::Io(_) => true,
            Self::Apply { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias using ProviderError.
pub type ProviderResult<T> = Result<T, ProviderError>;
