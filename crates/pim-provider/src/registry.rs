//! Provider registry.
//!
//! Concrete providers are registered as named factories (one per protocol
//! or provider kind) and all of them are constructed once, at startup. The
//! registry then routes commands by provider address.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::command::{CommandReply, CommandTarget, CommandTransport, Method};
use crate::lock::LockRegistry;
use crate::types::ResourceAddress;
use crate::{ProviderError, ProviderResult};

/// Builds one provider, taking its lock from the shared registry.
pub type ProviderFactory =
    Box<dyn Fn(&LockRegistry) -> ProviderResult<Arc<dyn CommandTarget>> + Send + Sync>;

/// Collects named provider factories.
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    factories: Vec<(String, ProviderFactory)>,
}

impl ProviderRegistryBuilder {
    pub fn factory<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&LockRegistry) -> ProviderResult<Arc<dyn CommandTarget>> + Send + Sync + 'static,
    {
        self.factories.push((name.into(), Box::new(factory)));
        self
    }

    /// Construct every provider. Names and addresses must be unique.
    pub fn build(self, locks: &LockRegistry) -> ProviderResult<ProviderRegistry> {
        let mut by_address: BTreeMap<ResourceAddress, Arc<dyn CommandTarget>> = BTreeMap::new();
        let mut by_name: BTreeMap<String, ResourceAddress> = BTreeMap::new();

        for (name, factory) in self.factories {
            if by_name.contains_key(&name) {
                return Err(ProviderError::Config(format!("duplicate provider name {name}")));
            }
            let provider = factory(locks)?;
            let address = provider.address().clone();
            if by_address.contains_key(&address) {
                return Err(ProviderError::Config(format!(
                    "provider {name} reuses address {address}"
                )));
            }
            debug!(name = %name, address = %address, "Provider registered");
            by_name.insert(name, address.clone());
            by_address.insert(address, provider);
        }

        Ok(ProviderRegistry {
            by_address,
            by_name,
        })
    }
}

/// Providers resolved at startup, addressable by address or by name.
pub struct ProviderRegistry {
    by_address: BTreeMap<ResourceAddress, Arc<dyn CommandTarget>>,
    by_name: BTreeMap<String, ResourceAddress>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&Arc<dyn CommandTarget>> {
        self.by_address.get(address)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn CommandTarget>> {
        self.by_name.get(name).and_then(|a| self.by_address.get(a))
    }

    /// All registered addresses, sorted.
    pub fn addresses(&self) -> Vec<ResourceAddress> {
        self.by_address.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

impl CommandTransport for ProviderRegistry {
    fn send(
        &self,
        target: &ResourceAddress,
        method: &Method,
        arg: Option<&Value>,
    ) -> ProviderResult<CommandReply> {
        let provider = self
            .get(target)
            .ok_or_else(|| ProviderError::UnknownAddress(target.to_string()))?;
        Ok(provider.dispatch(method, arg))
    }
}
