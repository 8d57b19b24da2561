#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ingress_class;

pub use self::ingress_class::IngressClass;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec},
        discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    ByteString,
};
pub use kube::{
    api::{ObjectMeta, Resource, ResourceExt},
    Client,
};

/// The label EndpointSlice controllers use to link a slice to its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// The Secret type that carries a certificate and its private key.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
