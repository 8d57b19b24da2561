use crate::{build, BuildError, Index, Resources};
use ingress_controller_core::{
    annotations::{standard, GlobalDefaults, Registry, ResolveError, Value, DEFAULT_PREFIX},
    model::{Endpoint, PathType, PortRef, DEFAULT_SERVER},
    ResourceId,
};
use ingress_controller_k8s_api::{
    ByteString, ConfigMap, EndpointConditions, EndpointPort, EndpointSlice, HTTPIngressPath,
    HTTPIngressRuleValue, Ingress, IngressBackend, IngressClass, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ObjectMeta, Secret, Service,
    ServiceBackendPort, ServicePort, ServiceSpec, SERVICE_NAME_LABEL, TLS_SECRET_TYPE,
};
use kubert::index::IndexNamespacedResource;
use maplit::{btreemap, convert_args};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, sync::Arc};

fn registry() -> Registry {
    Registry::standard(DEFAULT_PREFIX).expect("standard registry must be valid")
}

fn annotations(values: BTreeMap<&str, &str>) -> BTreeMap<String, String> {
    values
        .into_iter()
        .map(|(k, v)| (format!("{DEFAULT_PREFIX}/{k}"), v.to_string()))
        .collect()
}

fn mk_ingress(
    ns: &str,
    name: &str,
    host: &str,
    service: &str,
    annotations: BTreeMap<String, String>,
) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            generation: Some(1),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some("nginx".to_string()),
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: service_backend(service, "http"),
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_backend(name: &str, port: &str) -> IngressBackend {
    IngressBackend {
        service: Some(IngressServiceBackend {
            name: name.to_string(),
            port: Some(ServiceBackendPort {
                name: Some(port.to_string()),
                number: None,
            }),
        }),
        ..Default::default()
    }
}

fn mk_service(ns: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_slice(ns: &str, service: &str, endpoints: &[(&str, Option<bool>)]) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(format!("{service}-abcde")),
            labels: Some(convert_args!(btreemap!(SERVICE_NAME_LABEL => service))),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .iter()
            .map(|(ip, ready)| ingress_controller_k8s_api::Endpoint {
                addresses: vec![ip.to_string()],
                conditions: Some(EndpointConditions {
                    ready: *ready,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("http".to_string()),
            port: Some(8080),
            ..Default::default()
        }]),
    }
}

fn endpoint(ip: &str) -> Endpoint {
    Endpoint {
        address: ip.to_string(),
        port: 8080,
    }
}

#[test]
fn one_bad_ingress_does_not_block_the_others() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .ok();

    let mut resources = Resources::default();
    for i in 0..10 {
        let annotations = if i == 4 {
            annotations(btreemap!(standard::AUTH_URL => "bar"))
        } else {
            annotations(btreemap!(standard::AUTH_URL => "http://bar.foo.com/external-auth"))
        };
        resources.ingresses.push(mk_ingress(
            "default",
            &format!("ing-{i}"),
            &format!("host-{i}.example.com"),
            "web",
            annotations,
        ));
    }
    resources.services.push(mk_service("default", "web"));

    let (config, errors) = build(&resources, &registry(), &GlobalDefaults::default());

    assert_eq!(config.servers().len(), 9);
    assert!(config.server("host-4.example.com").is_none());
    assert_eq!(errors.len(), 1, "{errors:?}");
    match &errors[0] {
        BuildError::Excluded { resource, causes } => {
            assert_eq!(*resource, ResourceId::new("default", "ing-4"));
            assert_eq!(causes.len(), 1);
            assert!(matches!(causes[0], ResolveError::Annotation { .. }));
        }
        error => panic!("unexpected error: {error}"),
    }
}

#[test]
fn backends_join_services_and_ready_endpoints() {
    let resources = Resources {
        ingresses: vec![mk_ingress(
            "default",
            "web",
            "web.example.com",
            "web",
            annotations(btreemap!(
                standard::LOAD_BALANCE => "ewma",
                standard::UPSTREAM_MAX_FAILS => "3",
                standard::PROXY_READ_TIMEOUT => "120",
            )),
        )],
        services: vec![mk_service("default", "web")],
        endpoint_slices: vec![mk_slice(
            "default",
            "web",
            &[
                ("10.0.0.2", Some(true)),
                ("10.0.0.1", None),
                ("10.0.0.3", Some(false)),
            ],
        )],
        secrets: vec![],
    };

    let (config, errors) = build(&resources, &registry(), &GlobalDefaults::default());
    assert!(errors.is_empty(), "{errors:?}");

    let backend = config.backend("default-web-http").expect("backend must exist");
    assert_eq!(backend.service.port, PortRef::Name("http".to_string()));
    assert_eq!(backend.endpoints, vec![endpoint("10.0.0.1"), endpoint("10.0.0.2")]);
    assert_eq!(backend.policy.load_balance, "ewma");
    assert_eq!(backend.policy.max_fails, 3);

    let server = config.server("web.example.com").expect("server must exist");
    let location = &server.locations[0];
    assert_eq!(location.path, "/");
    assert_eq!(location.path_type, PathType::Prefix);
    assert_eq!(location.backend, "default-web-http");
    assert_eq!(
        location
            .settings
            .get(standard::PROXY_READ_TIMEOUT)
            .map(ToString::to_string),
        Some("120s".to_string())
    );
    // Backend-scoped values stay off locations.
    assert!(!location.settings.contains_key(standard::LOAD_BALANCE));
}

#[test]
fn service_upstream_uses_the_cluster_ip() {
    let resources = Resources {
        ingresses: vec![mk_ingress(
            "default",
            "web",
            "web.example.com",
            "web",
            annotations(btreemap!(standard::SERVICE_UPSTREAM => "true")),
        )],
        services: vec![mk_service("default", "web")],
        endpoint_slices: vec![mk_slice("default", "web", &[("10.0.0.1", Some(true))])],
        secrets: vec![],
    };
    let (config, _) = build(&resources, &registry(), &GlobalDefaults::default());
    assert_eq!(
        config.backend("default-web-http").unwrap().endpoints,
        vec![Endpoint {
            address: "10.96.0.10".to_string(),
            port: 80,
        }]
    );
}

#[test]
fn external_name_services() {
    let mut service = mk_service("default", "external");
    service.spec = Some(ServiceSpec {
        type_: Some("ExternalName".to_string()),
        external_name: Some("api.example.org".to_string()),
        ..Default::default()
    });
    let resources = Resources {
        ingresses: vec![mk_ingress(
            "default",
            "ext",
            "ext.example.com",
            "external",
            Default::default(),
        )],
        services: vec![service],
        endpoint_slices: vec![],
        secrets: vec![],
    };
    let (config, _) = build(&resources, &registry(), &GlobalDefaults::default());
    assert_eq!(
        config.backend("default-external-http").unwrap().endpoints,
        vec![Endpoint {
            address: "api.example.org".to_string(),
            port: 80,
        }]
    );
}

#[test]
fn default_backend_and_aliases() {
    let mut ing = mk_ingress(
        "default",
        "web",
        "web.example.com",
        "web",
        annotations(btreemap!(standard::SERVER_ALIAS => "www.example.com, web.example.org")),
    );
    if let Some(spec) = ing.spec.as_mut() {
        spec.default_backend = Some(service_backend("fallback", "http"));
    }
    let resources = Resources {
        ingresses: vec![ing],
        services: vec![mk_service("default", "web"), mk_service("default", "fallback")],
        endpoint_slices: vec![],
        secrets: vec![],
    };
    let (config, errors) = build(&resources, &registry(), &GlobalDefaults::default());
    assert!(errors.is_empty(), "{errors:?}");

    let catch_all = config.server(DEFAULT_SERVER).expect("default server must exist");
    assert_eq!(catch_all.locations[0].backend, "default-fallback-http");
    assert!(catch_all.aliases.is_empty());

    let web = config.server("web.example.com").unwrap();
    assert_eq!(web.aliases, ["web.example.org", "www.example.com"]);
}

#[test]
fn duplicate_locations_are_last_write_wins() {
    let first = mk_ingress("a", "first", "web.example.com", "one", Default::default());
    let second = mk_ingress("b", "second", "web.example.com", "two", Default::default());
    // Input order must not matter.
    let resources = Resources {
        ingresses: vec![second, first],
        services: vec![],
        endpoint_slices: vec![],
        secrets: vec![],
    };
    let (config, errors) = build(&resources, &registry(), &GlobalDefaults::default());
    assert!(errors.is_empty(), "{errors:?}");
    let server = config.server("web.example.com").unwrap();
    assert_eq!(server.locations.len(), 1);
    assert_eq!(server.locations[0].backend, "b-two-http");
    assert_eq!(server.locations[0].ingress, ResourceId::new("b", "second"));
}

#[test]
fn global_defaults_apply_to_backends() {
    let registry = registry();
    let (defaults, errors) =
        registry.global_defaults(&convert_args!(btreemap!(standard::LOAD_BALANCE => "ewma")));
    assert!(errors.is_empty());
    let resources = Resources {
        ingresses: vec![mk_ingress(
            "default",
            "web",
            "web.example.com",
            "web",
            Default::default(),
        )],
        ..Default::default()
    };
    let (config, _) = build(&resources, &registry, &defaults);
    assert_eq!(
        config.backend("default-web-http").unwrap().policy.load_balance,
        "ewma"
    );
}

fn with_tls(mut ing: Ingress, host: &str, secret: &str) -> Ingress {
    if let Some(spec) = ing.spec.as_mut() {
        spec.tls = Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: Some(secret.to_string()),
        }]);
    }
    ing
}

fn mk_tls_secret(ns: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(convert_args!(
            keys = String::from,
            btreemap!(
                "tls.crt" => ByteString(format!("{name}-crt").into_bytes()),
                "tls.key" => ByteString(b"key".to_vec()),
            )
        )),
        ..Default::default()
    }
}

#[test]
fn certificates_link_by_host() {
    let ing = mk_ingress("default", "web", "web.example.com", "web", Default::default());
    let resources = Resources {
        ingresses: vec![with_tls(ing, "web.example.com", "web-tls")],
        secrets: vec![mk_tls_secret("default", "web-tls")],
        ..Default::default()
    };
    let (config, _) = build(&resources, &registry(), &GlobalDefaults::default());
    assert_eq!(config.certificates().len(), 1);
    assert_eq!(config.certificates()[0].host, "web.example.com");
    assert_eq!(
        config.certificates()[0].secret,
        ResourceId::new("default", "web-tls")
    );
}

#[test]
fn excluded_ingresses_link_no_certificates() {
    let good = mk_ingress("default", "a-good", "web.example.com", "web", Default::default());
    let bad = mk_ingress(
        "default",
        "z-bad",
        "web.example.com",
        "web",
        annotations(btreemap!(standard::AUTH_URL => "bar")),
    );
    let (index, _) = mk_index(None);
    index.write().apply(good.clone());
    index.write().apply(with_tls(bad, "web.example.com", "bad-tls"));
    index.write().apply(mk_tls_secret("default", "bad-tls"));

    let snapshot = index.read().snapshot();
    let (config, errors) = build(&snapshot.resources, &registry(), &snapshot.defaults);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(config.server("web.example.com").is_some());
    assert!(config.certificates().is_empty(), "{:?}", config.certificates());

    // The excluded Ingress can't replace the certificate of a valid one either.
    index
        .write()
        .apply(with_tls(good, "web.example.com", "good-tls"));
    index.write().apply(mk_tls_secret("default", "good-tls"));
    let snapshot = index.read().snapshot();
    let (config, _) = build(&snapshot.resources, &registry(), &snapshot.defaults);
    assert_eq!(config.certificates().len(), 1);
    assert_eq!(
        config.certificates()[0].secret,
        ResourceId::new("default", "good-tls")
    );
}

#[test]
fn builds_are_deterministic() {
    let resources = Resources {
        ingresses: (0..5)
            .map(|i| {
                mk_ingress(
                    "default",
                    &format!("ing-{i}"),
                    &format!("h{i}.example.com"),
                    &format!("svc-{i}"),
                    Default::default(),
                )
            })
            .collect(),
        ..Default::default()
    };
    let mut reversed = resources.clone();
    reversed.ingresses.reverse();

    let registry = registry();
    let (a, _) = build(&resources, &registry, &GlobalDefaults::default());
    let (b, _) = build(&reversed, &registry, &GlobalDefaults::default());
    assert_eq!(a, b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
}

// === Index ===

fn mk_index(
    settings: Option<ResourceId>,
) -> (crate::SharedIndex, tokio::sync::watch::Receiver<u64>) {
    Index::shared(IngressClass::new("nginx"), Arc::new(registry()), settings)
}

#[test]
fn index_filters_by_class() {
    let (index, changes) = mk_index(None);
    let mut ing = mk_ingress("default", "web", "web.example.com", "web", Default::default());
    index.write().apply(ing.clone());
    assert_eq!(*changes.borrow(), 1);
    assert_eq!(index.read().snapshot().resources.ingresses.len(), 1);

    // Moving to another class removes the Ingress.
    if let Some(spec) = ing.spec.as_mut() {
        spec.ingress_class_name = Some("other".to_string());
    }
    index.write().apply(ing.clone());
    assert_eq!(*changes.borrow(), 2);
    assert!(index.read().snapshot().resources.ingresses.is_empty());

    // Unrelated Ingresses don't wake the reconciler.
    index.write().apply(ing);
    assert_eq!(*changes.borrow(), 2);
}

#[test]
fn index_tracks_tls_secrets_only() {
    let (index, changes) = mk_index(None);
    let opaque = Secret {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("creds".to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    index.write().apply(opaque);
    assert_eq!(*changes.borrow(), 0);

    <Index as IndexNamespacedResource<Service>>::apply(
        &mut index.write(),
        mk_service("default", "web"),
    );
    <Index as IndexNamespacedResource<Service>>::delete(
        &mut index.write(),
        "default".to_string(),
        "web".to_string(),
    );
    assert_eq!(*changes.borrow(), 2);
    assert!(index.read().snapshot().resources.services.is_empty());
}

#[test]
fn index_reads_global_defaults() {
    let settings = ResourceId::new("ingress", "settings");
    let (index, changes) = mk_index(Some(settings));
    let mk_cm = |name: &str, data: BTreeMap<String, String>| ConfigMap {
        metadata: ObjectMeta {
            namespace: Some("ingress".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    index.write().apply(mk_cm(
        "unrelated",
        convert_args!(btreemap!(standard::LOAD_BALANCE => "ewma")),
    ));
    assert_eq!(*changes.borrow(), 0);

    index.write().apply(mk_cm(
        "settings",
        convert_args!(btreemap!(
            standard::LOAD_BALANCE => "ewma",
            standard::LIMIT_RPS => "-3",
            "worker-processes" => "4",
        )),
    ));
    assert_eq!(*changes.borrow(), 1);
    let defaults = index.read().snapshot().defaults;
    assert_eq!(defaults.len(), 1);
    assert_eq!(
        defaults.get(standard::LOAD_BALANCE),
        Some(&Value::String("ewma".to_string()))
    );

    <Index as IndexNamespacedResource<ConfigMap>>::delete(
        &mut index.write(),
        "ingress".to_string(),
        "settings".to_string(),
    );
    assert!(index.read().snapshot().defaults.is_empty());
}

#[test]
fn snapshot_builds_endpoint_updates() {
    let (index, _) = mk_index(None);
    index
        .write()
        .apply(mk_ingress("default", "web", "web.example.com", "web", Default::default()));
    index.write().apply(mk_service("default", "web"));
    index
        .write()
        .apply(mk_slice("default", "web", &[("10.0.0.1", Some(true))]));

    let registry = registry();
    let build_snapshot = || {
        let snapshot = index.read().snapshot();
        build(
            &snapshot.resources,
            &registry,
            &snapshot.defaults,
        )
        .0
    };

    let before = build_snapshot();
    index.write().apply(mk_slice(
        "default",
        "web",
        &[("10.0.0.1", Some(true)), ("10.0.0.2", Some(true))],
    ));
    let after = build_snapshot();

    assert_eq!(
        ingress_controller_core::compare(&before, &after),
        ingress_controller_core::ChangeClass::Dynamic
    );
}
