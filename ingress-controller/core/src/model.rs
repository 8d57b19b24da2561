//! The desired proxy configuration.
//!
//! A [`Configuration`] is built once per reconciliation pass and never mutated. Its contents are
//! kept sorted so that two configurations built from the same inputs compare and serialize
//! identically.

use crate::{
    annotations::{Timeout, Value},
    ResourceId,
};
use ahash::AHashSet as HashSet;
use serde::Serialize;
use std::{collections::BTreeMap, fmt};

/// Names the catch-all server that default backends attach to.
pub const DEFAULT_SERVER: &str = "_";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Configuration {
    backends: Vec<Backend>,
    servers: Vec<Server>,
    certificates: Vec<Certificate>,
}

/// A named set of upstream targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub name: String,
    pub service: ServiceRef,
    pub endpoints: Vec<Endpoint>,
    pub policy: BackendPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: PortRef,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Endpoint {
    /// An IP address, or a DNS name for `ExternalName` services.
    pub address: String,
    pub port: u16,
}

/// Load-balancing and passive health parameters for a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendPolicy {
    pub load_balance: String,
    pub upstream_hash_by: Option<String>,
    pub max_fails: u32,
    pub fail_timeout: Timeout,
    pub service_upstream: bool,
    pub protocol: String,
}

/// A virtual host.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Server {
    pub hostname: String,
    pub aliases: Vec<String>,
    pub locations: Vec<Location>,
}

/// A path rule on a server.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Location {
    pub path: String,
    pub path_type: PathType,
    pub backend: String,
    /// The Ingress that contributed this rule.
    pub ingress: ResourceId,
    pub settings: BTreeMap<&'static str, Value>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PathType {
    Exact,
    Prefix,
    ImplementationSpecific,
}

/// Associates a host with its key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub host: String,
    pub secret: ResourceId,
    /// Hex SHA-256 of the certificate and key bytes.
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("backend {0} is defined more than once")]
    DuplicateBackend(String),

    #[error("server {0} is defined more than once")]
    DuplicateServer(String),

    #[error("server {server} has more than one {path_type:?} location for {path}")]
    DuplicateLocation {
        server: String,
        path: String,
        path_type: PathType,
    },

    #[error("certificate for {0} is defined more than once")]
    DuplicateCertificate(String),

    #[error("location {path} on server {server} references unknown backend {backend}")]
    DanglingBackend {
        server: String,
        path: String,
        backend: String,
    },
}

// === impl Configuration ===

impl Configuration {
    /// Validates and normalizes a configuration.
    ///
    /// Backend, server, and certificate names must be unique and every location must reference a
    /// backend in the same configuration.
    pub fn new(
        mut backends: Vec<Backend>,
        mut servers: Vec<Server>,
        mut certificates: Vec<Certificate>,
    ) -> Result<Self, ModelError> {
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(dup) = duplicate(backends.iter().map(|b| &b.name)) {
            return Err(ModelError::DuplicateBackend(dup.clone()));
        }
        for backend in &mut backends {
            backend.endpoints.sort();
            backend.endpoints.dedup();
        }

        servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        if let Some(dup) = duplicate(servers.iter().map(|s| &s.hostname)) {
            return Err(ModelError::DuplicateServer(dup.clone()));
        }
        let names = backends
            .iter()
            .map(|b| b.name.as_str())
            .collect::<HashSet<_>>();
        for server in &mut servers {
            server.aliases.sort();
            server.aliases.dedup();
            server.locations.sort_by(|a, b| {
                a.path
                    .cmp(&b.path)
                    .then_with(|| a.path_type.cmp(&b.path_type))
            });
            for pair in server.locations.windows(2) {
                if pair[0].path == pair[1].path && pair[0].path_type == pair[1].path_type {
                    return Err(ModelError::DuplicateLocation {
                        server: server.hostname.clone(),
                        path: pair[0].path.clone(),
                        path_type: pair[0].path_type,
                    });
                }
            }
            if let Some(loc) = server
                .locations
                .iter()
                .find(|l| !names.contains(l.backend.as_str()))
            {
                return Err(ModelError::DanglingBackend {
                    server: server.hostname.clone(),
                    path: loc.path.clone(),
                    backend: loc.backend.clone(),
                });
            }
        }

        certificates.sort_by(|a, b| a.host.cmp(&b.host));
        if let Some(dup) = duplicate(certificates.iter().map(|c| &c.host)) {
            return Err(ModelError::DuplicateCertificate(dup.clone()));
        }

        Ok(Self {
            backends,
            servers,
            certificates,
        })
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends
            .binary_search_by(|b| b.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.backends[i])
    }

    pub fn server(&self, hostname: &str) -> Option<&Server> {
        self.servers
            .binary_search_by(|s| s.hostname.as_str().cmp(hostname))
            .ok()
            .map(|i| &self.servers[i])
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty() && self.servers.is_empty() && self.certificates.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Returns the first repeated item of a sorted sequence.
fn duplicate<'a>(mut sorted: impl Iterator<Item = &'a String>) -> Option<&'a String> {
    let mut prev = sorted.next()?;
    for item in sorted {
        if item == prev {
            return Some(item);
        }
        prev = item;
    }
    None
}

// === impl Backend ===

impl Backend {
    /// The backend name for a service port.
    pub fn name_for(namespace: &str, service: &str, port: &PortRef) -> String {
        format!("{namespace}-{service}-{port}")
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => n.fmt(f),
            Self::Name(n) => n.fmt(f),
        }
    }
}

// === impl BackendPolicy ===

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            load_balance: "round_robin".to_string(),
            upstream_hash_by: None,
            max_fails: 0,
            fail_timeout: Timeout::from_secs(10),
            service_upstream: false,
            protocol: "HTTP".to_string(),
        }
    }
}
