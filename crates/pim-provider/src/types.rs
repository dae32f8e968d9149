//! Core types shared across the provider layer.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

/// Opaque address of a provider or of a resource inside a provider.
///
/// Used for routing operations, for change notifications, and as the target
/// of lock and upgrade commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceAddress(String);

impl ResourceAddress {
    /// Creates an address from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceAddress {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for ResourceAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Column values for inserts and updates, ordered by column name.
pub type Values = BTreeMap<String, Value>;

/// One result row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Access mode requested from a store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn is_read(self) -> bool {
        self == Self::Read
    }
}

/// A `WHERE` clause with positional (`?`) arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub clause: String,
    pub args: Vec<Value>,
}

impl Selection {
    pub fn new(clause: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            clause: clause.into(),
            args,
        }
    }

    /// Shorthand for `column = ?`.
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(format!("{} = ?", crate::sql::quote_ident(column)), vec![value.into()])
    }
}

/// A read request against one resource address.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub target: ResourceAddress,
    /// Columns to return; `None` selects all.
    pub columns: Option<Vec<String>>,
    pub selection: Option<Selection>,
    /// Comma-separated `column [ASC|DESC]` terms.
    pub order_by: Option<String>,
}

impl Query {
    pub fn all(target: impl Into<ResourceAddress>) -> Self {
        Self {
            target: target.into(),
            columns: None,
            selection: None,
            order_by: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn filter(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }
}

/// Build a [`Values`] map from `(column, value)` pairs.
pub fn values<I, K, V>(pairs: I) -> Values
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
