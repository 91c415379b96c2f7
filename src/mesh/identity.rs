//! Daemon identity and well-known topic names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique name of a daemon instance.
///
/// Identities compare by exact byte equality; lexicographic order is the
/// tie-break everywhere a deterministic choice is needed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl From<&str> for Identity {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Topic strings routed by the endpoint manager.
pub mod topics {
    pub const DISCOVERY_REGISTER: &str = "discovery.register";
    pub const DISCOVERY_ANNOUNCE: &str = "discovery.announce";
    pub const DISCOVERY_WELCOME: &str = "discovery.welcome";
    pub const DELEGATION_ASSIGN: &str = "delegation.assign";
    pub const DELEGATION_CLEAR: &str = "delegation.clear";
    /// Pre-registration identity exchange, sent exactly once per connection.
    pub const TRANSPORT_IDENT: &str = "transport.ident";
}
