//! The maintenance command surface.
//!
//! Commands are plain method names plus an optional JSON argument, so the
//! same contract works in-process or across an IPC boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store_set::StoreSet;
use crate::types::ResourceAddress;
use crate::ProviderResult;

/// Command names understood by every provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// Apply pending schema migrations to every store.
    DbUpgrade,
    DbLock,
    DbUnlock,
    /// Run vacuum/analyze on every store.
    DbMaintenanceStart,
    /// Provider-specific command, forwarded to the provider's call handler.
    Custom(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DbUpgrade => "db_upgrade",
            Self::DbLock => "db_lock",
            Self::DbUnlock => "db_unlock",
            Self::DbMaintenanceStart => "db_maintenance_start",
            Self::Custom(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "db_upgrade" => Self::DbUpgrade,
            "db_lock" => Self::DbLock,
            "db_unlock" => Self::DbUnlock,
            "db_maintenance_start" => Self::DbMaintenanceStart,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            data: None,
        }
    }

    pub fn from_success(success: bool) -> Self {
        Self {
            success,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Something that accepts commands addressed to it.
pub trait CommandTarget: Send + Sync {
    fn address(&self) -> &ResourceAddress;

    fn dispatch(&self, method: &Method, arg: Option<&Value>) -> CommandReply;
}

/// Delivers commands to providers by address.
pub trait CommandTransport: Send + Sync {
    fn send(
        &self,
        target: &ResourceAddress,
        method: &Method,
        arg: Option<&Value>,
    ) -> ProviderResult<CommandReply>;
}

/// Handles provider-specific commands while the provider is unlocked.
pub trait CallHandler: Send + Sync {
    fn call(&self, stores: &StoreSet, method: &str, arg: Option<&Value>) -> ProviderResult<CommandReply>;
}
