use crate::model::{Backend, Configuration, Endpoint};
use serde::Serialize;

/// How the data plane must be updated to move from one configuration to another.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeClass {
    NoChange,

    /// Only backend endpoints changed. Can be applied without a reload.
    Dynamic,

    FullReload,
}

/// The complete endpoint set of one backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendEndpoints {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

// === impl ChangeClass ===

impl ChangeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::Dynamic => "dynamic",
            Self::FullReload => "full_reload",
        }
    }
}

/// Classifies the change from `prev` to `next`.
///
/// Any difference other than backend membership requires a full reload. Both configurations are
/// sorted by construction, so backends are compared pairwise.
pub fn compare(prev: &Configuration, next: &Configuration) -> ChangeClass {
    if std::ptr::eq(prev, next) || prev == next {
        return ChangeClass::NoChange;
    }

    if prev.servers() != next.servers() || prev.certificates() != next.certificates() {
        return ChangeClass::FullReload;
    }

    if prev.backends().len() != next.backends().len() {
        return ChangeClass::FullReload;
    }
    let same_shape = prev
        .backends()
        .iter()
        .zip(next.backends())
        .all(|(p, n)| p.name == n.name && p.service == n.service && p.policy == n.policy);
    if !same_shape {
        return ChangeClass::FullReload;
    }

    ChangeClass::Dynamic
}

/// Lists the backends of `next` whose endpoints differ from `prev`.
///
/// Backends absent from `prev` are included with their full endpoint set.
pub fn endpoint_changes(prev: &Configuration, next: &Configuration) -> Vec<BackendEndpoints> {
    next.backends()
        .iter()
        .filter(|n| {
            prev.backend(&n.name)
                .map_or(true, |p: &Backend| p.endpoints != n.endpoints)
        })
        .map(|b| BackendEndpoints {
            name: b.name.clone(),
            endpoints: b.endpoints.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{BackendPolicy, Certificate, Location, PathType, PortRef, Server, ServiceRef},
        ResourceId,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn endpoint(ip: &str) -> Endpoint {
        Endpoint {
            address: ip.to_string(),
            port: 8080,
        }
    }

    fn backend(name: &str, ips: &[&str]) -> Backend {
        Backend {
            name: name.to_string(),
            service: ServiceRef {
                namespace: "default".to_string(),
                name: name.to_string(),
                port: PortRef::Name("http".to_string()),
            },
            endpoints: ips.iter().copied().map(endpoint).collect(),
            policy: BackendPolicy::default(),
        }
    }

    fn server(host: &str, backend: &str) -> Server {
        Server {
            hostname: host.to_string(),
            aliases: vec![],
            locations: vec![Location {
                path: "/".to_string(),
                path_type: PathType::Prefix,
                backend: backend.to_string(),
                ingress: ResourceId::new("default", host),
                settings: BTreeMap::new(),
            }],
        }
    }

    fn config(backends: Vec<Backend>, servers: Vec<Server>) -> Configuration {
        Configuration::new(backends, servers, vec![]).expect("configuration must be valid")
    }

    #[test]
    fn identical() {
        let c = config(
            vec![backend("web", &["10.0.0.1"])],
            vec![server("web.example.com", "web")],
        );
        assert_eq!(compare(&c, &c), ChangeClass::NoChange);
        assert_eq!(compare(&c, &c.clone()), ChangeClass::NoChange);
        assert_eq!(
            compare(&Configuration::default(), &Configuration::default()),
            ChangeClass::NoChange
        );
    }

    #[test]
    fn endpoint_churn_is_dynamic_in_both_directions() {
        let servers = vec![server("web.example.com", "web")];
        let c1 = config(
            vec![backend("web", &["10.0.0.1"]), backend("api", &["10.0.1.1"])],
            servers.clone(),
        );
        let c2 = config(
            vec![
                backend("web", &["10.0.0.1", "10.0.0.2"]),
                backend("api", &["10.0.1.1"]),
            ],
            servers,
        );
        assert_eq!(compare(&c1, &c2), ChangeClass::Dynamic);
        assert_eq!(compare(&c2, &c1), ChangeClass::Dynamic);

        assert_eq!(
            endpoint_changes(&c1, &c2),
            vec![BackendEndpoints {
                name: "web".to_string(),
                endpoints: vec![endpoint("10.0.0.1"), endpoint("10.0.0.2")],
            }]
        );
        assert_eq!(
            endpoint_changes(&c2, &c1),
            vec![BackendEndpoints {
                name: "web".to_string(),
                endpoints: vec![endpoint("10.0.0.1")],
            }]
        );
    }

    #[test]
    fn new_server_is_a_full_reload() {
        let backends = vec![backend("web", &["10.0.0.1"])];
        let c1 = config(backends.clone(), vec![server("web.example.com", "web")]);
        let c2 = config(
            backends,
            vec![
                server("web.example.com", "web"),
                server("www.example.com", "web"),
            ],
        );
        assert_eq!(compare(&c1, &c2), ChangeClass::FullReload);
        assert_eq!(compare(&c2, &c1), ChangeClass::FullReload);
    }

    #[test]
    fn structural_backend_changes_are_full_reloads() {
        let servers = vec![server("web.example.com", "web")];
        let base = config(vec![backend("web", &["10.0.0.1"])], servers.clone());

        let mut ewma = backend("web", &["10.0.0.1"]);
        ewma.policy.load_balance = "ewma".to_string();
        let policy = config(vec![ewma], servers.clone());
        assert_eq!(compare(&base, &policy), ChangeClass::FullReload);

        let added = config(
            vec![backend("web", &["10.0.0.1"]), backend("unused", &[])],
            servers,
        );
        assert_eq!(compare(&base, &added), ChangeClass::FullReload);
    }

    #[test]
    fn certificate_rotation_is_a_full_reload() {
        let backends = vec![backend("web", &["10.0.0.1"])];
        let servers = vec![server("web.example.com", "web")];
        let cert = |checksum: &str| Certificate {
            host: "web.example.com".to_string(),
            secret: ResourceId::new("default", "web-tls"),
            checksum: checksum.to_string(),
        };
        let c1 = Configuration::new(backends.clone(), servers.clone(), vec![cert("aa")]).unwrap();
        let c2 = Configuration::new(backends, servers, vec![cert("bb")]).unwrap();
        assert_eq!(compare(&c1, &c2), ChangeClass::FullReload);
    }
}
