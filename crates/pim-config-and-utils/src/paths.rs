//! File system paths for the providers and the maintenance service.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Manages file system paths.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.pimstore)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.pimstore`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir().ok_or(CoreError::NoHomeDir)?;

        Ok(Self {
            base_dir: home.join(".pimstore"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.pimstore).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.pimstore/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the maintenance state database (~/.pimstore/maintenance.sqlite).
    pub fn state_database_file(&self) -> PathBuf {
        self.base_dir.join("maintenance.sqlite")
    }

    /// Get the directory holding provider databases (~/.pimstore/stores).
    pub fn stores_dir(&self) -> PathBuf {
        self.base_dir.join("stores")
    }

    /// Get the path of one provider database file.
    pub fn store_file(&self, file_name: &str) -> PathBuf {
        self.stores_dir().join(file_name)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.stores_dir())?;
        Ok(())
    }
}
