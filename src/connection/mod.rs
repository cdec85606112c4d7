//! Connection management for conduit.
//!
//! Owns the process-wide registry of live backend connections and the rules
//! for turning backend configuration plus a principal into a connection
//! target.

pub mod registry;
pub mod template;

pub use registry::ConnectionRegistry;
pub use template::{apply_impersonation, connection_url, resolve_url};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached connection: one per (principal, backend) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub principal: String,
    pub backend: String,
}

impl ConnectionKey {
    pub fn new(principal: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            backend: backend.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.principal, self.backend)
    }
}

/// A `{name, value}` session property supplied with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProperty {
    pub name: String,
    pub value: String,
}

impl SessionProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The already-authenticated user a request runs for, plus any session
/// properties (credentials) it supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub properties: Vec<SessionProperty>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            properties: Vec::new(),
        }
    }

    /// Adds a session property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push(SessionProperty::new(name, value));
        self
    }

    /// Looks up a session property by case-insensitive name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }
}
