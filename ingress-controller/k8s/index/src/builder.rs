//! Builds a [`Configuration`] from a snapshot of cluster resources.

use crate::tls::TlsSecrets;
use ahash::AHashMap as HashMap;
use ingress_controller_core::{
    annotations::{standard, GlobalDefaults, Registry, ResolveError, ResolvedConfig, Scope, Value},
    model::{
        Backend, BackendPolicy, Certificate, Endpoint, Location, PathType, PortRef, Server,
        ServiceRef, DEFAULT_SERVER,
    },
    Configuration, ModelError, ResourceId,
};
use ingress_controller_k8s_api::{
    EndpointSlice, Ingress, IngressServiceBackend, ResourceExt, Secret, Service, ServicePort,
    SERVICE_NAME_LABEL,
};
use std::collections::{BTreeMap, BTreeSet};

/// The resources a configuration is built from.
///
/// Ingresses must already be filtered to the controller's class.
#[derive(Clone, Debug, Default)]
pub struct Resources {
    pub ingresses: Vec<Ingress>,
    pub services: Vec<Service>,
    pub endpoint_slices: Vec<EndpointSlice>,
    /// TLS secrets, ordered by namespace and name.
    pub secrets: Vec<Secret>,
}

/// Why a build was incomplete.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// The Ingress had unusable annotations and contributes nothing to the configuration.
    #[error("ingress {resource} excluded: {}", display_causes(.causes))]
    Excluded {
        resource: ResourceId,
        causes: Vec<ResolveError>,
    },

    #[error("invalid configuration: {0}")]
    Model(#[from] ModelError),
}

#[derive(Default)]
struct ServerBuilder {
    aliases: BTreeSet<String>,
    locations: BTreeMap<(String, PathType), Location>,
}

struct Services<'a> {
    by_id: HashMap<ResourceId, &'a Service>,
    slices: HashMap<ResourceId, Vec<&'a EndpointSlice>>,
}

/// Builds the desired configuration.
///
/// Ingresses are visited ordered by namespace, name, and generation; when two of them define the
/// same backend or location, the later one wins. An Ingress whose annotations fail to resolve is
/// excluded and reported while the rest of the configuration is still built; its `tls` section
/// links no certificates.
pub fn build(
    resources: &Resources,
    registry: &Registry,
    defaults: &GlobalDefaults,
) -> (Configuration, Vec<BuildError>) {
    let mut ingresses = resources.ingresses.iter().collect::<Vec<_>>();
    ingresses.sort_by(|a, b| {
        let key = |i: &Ingress| {
            (
                i.metadata.namespace.clone().unwrap_or_default(),
                i.metadata.name.clone().unwrap_or_default(),
                i.metadata.generation.unwrap_or_default(),
            )
        };
        key(a).cmp(&key(b))
    });

    let services = Services::new(resources);
    let mut errors = Vec::new();
    let mut backends = BTreeMap::<String, Backend>::new();
    let mut servers = BTreeMap::<String, ServerBuilder>::new();
    let mut accepted = Vec::<&Ingress>::new();

    for ingress in ingresses {
        let config = match registry.resolve_all(&ingress.metadata, defaults) {
            Ok(config) => config,
            Err(causes) => {
                let resource = ResourceId::from_meta(&ingress.metadata).unwrap_or_default();
                tracing::info!(
                    namespace = %resource.namespace,
                    name = %resource.name,
                    errors = causes.len(),
                    "Excluding Ingress with invalid annotations"
                );
                errors.push(BuildError::Excluded { resource, causes });
                continue;
            }
        };
        let Some(id) = ResourceId::from_meta(&ingress.metadata) else {
            continue;
        };
        accepted.push(ingress);

        let policy = backend_policy(&config);
        let settings = config
            .in_scope(Scope::Location)
            .map(|(name, value)| (name, value.clone()))
            .collect::<BTreeMap<&'static str, Value>>();
        let aliases = config
            .list(standard::SERVER_ALIAS)
            .unwrap_or_default()
            .to_vec();

        let mut add_route = |host: &str,
                             path: String,
                             path_type: PathType,
                             svc: &IngressServiceBackend| {
            let service = service_ref(&id.namespace, svc);
            let backend = services.backend(service, policy.clone());
            let location = Location {
                path: path.clone(),
                path_type,
                backend: backend.name.clone(),
                ingress: id.clone(),
                settings: settings.clone(),
            };
            backends.insert(backend.name.clone(), backend);

            let server = servers.entry(host.to_string()).or_default();
            if host != DEFAULT_SERVER {
                server.aliases.extend(aliases.iter().cloned());
            }
            server.locations.insert((path, path_type), location);
        };

        let Some(spec) = ingress.spec.as_ref() else {
            continue;
        };

        if let Some(svc) = spec
            .default_backend
            .as_ref()
            .and_then(|b| b.service.as_ref())
        {
            add_route(DEFAULT_SERVER, "/".to_string(), PathType::Prefix, svc);
        }

        for rule in spec.rules.iter().flatten() {
            let host = rule
                .host
                .as_deref()
                .filter(|h| !h.is_empty())
                .unwrap_or(DEFAULT_SERVER);
            for path in rule.http.iter().flat_map(|http| &http.paths) {
                let Some(svc) = path.backend.service.as_ref() else {
                    tracing::debug!(ingress = %id, host, "Skipping path without a service backend");
                    continue;
                };
                let path_type = match path.path_type.as_str() {
                    "Exact" => PathType::Exact,
                    "Prefix" => PathType::Prefix,
                    _ => PathType::ImplementationSpecific,
                };
                let p = path.path.clone().unwrap_or_else(|| "/".to_string());
                add_route(host, p, path_type, svc);
            }
        }
    }

    let tls = TlsSecrets::new(accepted, &resources.secrets);
    let certificates = servers
        .keys()
        .filter(|host| host.as_str() != DEFAULT_SERVER)
        .filter_map(|host| {
            let cert = tls.lookup(host)?;
            Some(Certificate {
                host: host.clone(),
                secret: cert.secret,
                checksum: cert.checksum,
            })
        })
        .collect();
    let servers = servers
        .into_iter()
        .map(|(hostname, s)| Server {
            hostname,
            aliases: s.aliases.into_iter().collect(),
            locations: s.locations.into_values().collect(),
        })
        .collect();

    match Configuration::new(backends.into_values().collect(), servers, certificates) {
        Ok(config) => (config, errors),
        Err(error) => {
            errors.push(error.into());
            (Configuration::default(), errors)
        }
    }
}

fn backend_policy(config: &ResolvedConfig) -> BackendPolicy {
    let defaults = BackendPolicy::default();
    BackendPolicy {
        load_balance: config
            .string(standard::LOAD_BALANCE)
            .map(str::to_string)
            .unwrap_or(defaults.load_balance),
        upstream_hash_by: config.string(standard::UPSTREAM_HASH_BY).map(str::to_string),
        max_fails: config
            .int(standard::UPSTREAM_MAX_FAILS)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.max_fails),
        fail_timeout: config
            .duration(standard::UPSTREAM_FAIL_TIMEOUT)
            .cloned()
            .unwrap_or(defaults.fail_timeout),
        service_upstream: config
            .bool(standard::SERVICE_UPSTREAM)
            .unwrap_or(defaults.service_upstream),
        protocol: config
            .string(standard::BACKEND_PROTOCOL)
            .map(str::to_string)
            .unwrap_or(defaults.protocol),
    }
}

fn service_ref(namespace: &str, svc: &IngressServiceBackend) -> ServiceRef {
    let port = match svc.port.as_ref() {
        Some(p) => match (p.number, p.name.as_ref()) {
            (Some(n), _) => PortRef::Number(u16::try_from(n).unwrap_or_default()),
            (None, Some(name)) => PortRef::Name(name.clone()),
            (None, None) => PortRef::Number(0),
        },
        None => PortRef::Number(0),
    };
    ServiceRef {
        namespace: namespace.to_string(),
        name: svc.name.clone(),
        port,
    }
}

fn display_causes(causes: &[ResolveError]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// === impl Services ===

impl<'a> Services<'a> {
    fn new(resources: &'a Resources) -> Self {
        let by_id = resources
            .services
            .iter()
            .filter_map(|s| Some((ResourceId::from_meta(&s.metadata)?, s)))
            .collect();

        let mut slices = HashMap::<ResourceId, Vec<&'a EndpointSlice>>::new();
        for slice in &resources.endpoint_slices {
            let Some(service) = slice.labels().get(SERVICE_NAME_LABEL) else {
                continue;
            };
            let id = ResourceId::new(slice.namespace().unwrap_or_default(), service);
            slices.entry(id).or_default().push(slice);
        }

        Self { by_id, slices }
    }

    fn backend(&self, service: ServiceRef, policy: BackendPolicy) -> Backend {
        let name = Backend::name_for(&service.namespace, &service.name, &service.port);
        let endpoints = self.endpoints(&service, &policy);
        Backend {
            name,
            service,
            endpoints,
            policy,
        }
    }

    fn endpoints(&self, service: &ServiceRef, policy: &BackendPolicy) -> Vec<Endpoint> {
        let id = ResourceId::new(&service.namespace, &service.name);
        let Some(svc) = self.by_id.get(&id) else {
            tracing::debug!(service = %id, "Service not found");
            return vec![];
        };
        let Some(spec) = svc.spec.as_ref() else {
            return vec![];
        };
        let port = spec.ports.iter().flatten().find(|p| match &service.port {
            PortRef::Number(n) => p.port == i32::from(*n),
            PortRef::Name(name) => p.name.as_ref() == Some(name),
        });

        if spec.type_.as_deref() == Some("ExternalName") {
            let Some(external) = spec.external_name.clone() else {
                return vec![];
            };
            let port = match (&service.port, port) {
                (PortRef::Number(n), _) => *n,
                (PortRef::Name(_), Some(p)) => u16::try_from(p.port).unwrap_or_default(),
                (PortRef::Name(_), None) => 80,
            };
            return vec![Endpoint {
                address: external,
                port,
            }];
        }

        let Some(port) = port else {
            tracing::debug!(service = %id, port = %service.port, "Service port not found");
            return vec![];
        };

        if policy.service_upstream {
            return spec
                .cluster_ip
                .iter()
                .filter(|ip| !ip.is_empty() && ip.as_str() != "None")
                .map(|ip| Endpoint {
                    address: ip.clone(),
                    port: u16::try_from(port.port).unwrap_or_default(),
                })
                .collect();
        }

        self.slices
            .get(&id)
            .into_iter()
            .flatten()
            .flat_map(|slice| ready_endpoints(slice, port))
            .collect()
    }
}

/// Lists the ready addresses of a slice on the target of a service port.
fn ready_endpoints(slice: &EndpointSlice, port: &ServicePort) -> Vec<Endpoint> {
    let wanted = port.name.as_deref().unwrap_or_default();
    let Some(target) = slice
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref().unwrap_or_default() == wanted)
        .and_then(|p| p.port)
        .and_then(|p| u16::try_from(p).ok())
    else {
        return vec![];
    };

    slice
        .endpoints
        .iter()
        // A missing condition means the endpoint is ready.
        .filter(|ep| {
            ep.conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true)
        })
        .flat_map(|ep| ep.addresses.iter())
        .map(|address| Endpoint {
            address: address.clone(),
            port: target,
        })
        .collect()
}
