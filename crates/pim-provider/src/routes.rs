//! Resource address routing.
//!
//! Concrete providers declare which store and table serve each address.
//! Lookup takes the exact address first, then the longest registered prefix
//! that ends on a `/` boundary, so `contacts/people/42` resolves through
//! `contacts/people`.

use std::collections::HashMap;

use crate::types::ResourceAddress;
use crate::{ProviderError, ProviderResult};

/// The store and table that serve one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub store: String,
    pub table: String,
}

/// Address → route table.
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    routes: HashMap<String, Route>,
}

impl RouteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; a later registration for the same address wins.
    pub fn route(mut self, address: &str, store: &str, table: &str) -> Self {
        self.routes.insert(
            address.trim_end_matches('/').to_string(),
            Route {
                store: store.to_string(),
                table: table.to_string(),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every declared route.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &Route)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn resolve(&self, address: &ResourceAddress) -> ProviderResult<&Route> {
        let mut candidate = address.as_str().trim_end_matches('/');
        loop {
            if let Some(route) = self.routes.get(candidate) {
                return Ok(route);
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return Err(ProviderError::UnknownAddress(address.to_string())),
            }
        }
    }
}
