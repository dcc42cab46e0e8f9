// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint descriptions used to build channel factories.

use serde::{Deserialize, Serialize};

/// Transport binding settings, compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    /// Binding name.
    pub name: String,
    /// URI scheme, e.g. `net.tcp`.
    pub scheme: String,
    /// Whether channels run over a session.
    pub session: bool,
}

impl Binding {
    /// Sessionless binding.
    pub fn new(name: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheme: scheme.into(),
            session: false,
        }
    }

    /// Builder: mark as a session binding.
    pub fn with_session(mut self) -> Self {
        self.session = true;
        self
    }
}

/// A concrete target endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Optional endpoint name.
    pub name: Option<String>,
    /// Binding.
    pub binding: Binding,
    /// Default address; a per-send address overrides it.
    pub address: Option<String>,
}

impl Endpoint {
    /// Endpoint with a binding and default address.
    pub fn new(binding: Binding, address: Option<String>) -> Self {
        Self {
            name: None,
            binding,
            address,
        }
    }
}

/// Where a send's endpoint comes from.
///
/// Endpoints declared with the send are fixed for the workflow definition
/// and can share the factory cache. Endpoints resolved by configuration name
/// are looked up at run time and only share the cache when unsafe caching is
/// allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointSource {
    /// Endpoint declared with the send.
    Explicit(Endpoint),
    /// Endpoint resolved from host configuration.
    Configuration {
        /// Configuration name.
        name: String,
        /// The endpoint it resolved to.
        endpoint: Endpoint,
    },
}

impl EndpointSource {
    /// The endpoint to build factories from.
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Explicit(endpoint) | Self::Configuration { endpoint, .. } => endpoint,
        }
    }

    /// Whether the factory may go into the shared cache without opting in.
    pub fn is_safe_for_cache(&self) -> bool {
        matches!(self, Self::Explicit(_))
    }

    /// Identity used in the factory cache key.
    pub fn identity(&self) -> EndpointIdentity {
        match self {
            Self::Explicit(endpoint) => EndpointIdentity::Endpoint(endpoint.clone()),
            Self::Configuration { name, .. } => EndpointIdentity::ConfigurationName(name.clone()),
        }
    }
}

/// Endpoint part of a factory cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointIdentity {
    /// Compared by endpoint settings.
    Endpoint(Endpoint),
    /// Compared by configuration name.
    ConfigurationName(String),
}

/// Windows-style token impersonation level carried by client credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenImpersonationLevel {
    /// Not set.
    None,
    /// Anonymous.
    Anonymous,
    /// Identification only.
    #[default]
    Identification,
    /// Impersonation.
    Impersonation,
    /// Delegation.
    Delegation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_safety_by_source() {
        let endpoint = Endpoint::new(Binding::new("tcp", "net.tcp"), None);
        assert!(EndpointSource::Explicit(endpoint.clone()).is_safe_for_cache());
        assert!(
            !EndpointSource::Configuration {
                name: "bank".to_string(),
                endpoint,
            }
            .is_safe_for_cache()
        );
    }

    #[test]
    fn test_identity_compares_structurally() {
        let a = EndpointSource::Explicit(Endpoint::new(Binding::new("tcp", "net.tcp"), None));
        let b = EndpointSource::Explicit(Endpoint::new(Binding::new("tcp", "net.tcp"), None));
        let c = EndpointSource::Explicit(Endpoint::new(
            Binding::new("tcp", "net.tcp").with_session(),
            None,
        ));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }
}
