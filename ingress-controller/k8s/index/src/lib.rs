//! Ingress resource index
//!
//! Watches the cluster resources that describe routing intent and turns a snapshot of them into
//! a proxy [`Configuration`](ingress_controller_core::Configuration):
//!
//! - Each `Ingress` of the controller's class contributes servers (one per host), locations (one
//!   per path), and the backends those locations route to. Its annotations are resolved through
//!   the annotation registry.
//! - `Service` and `EndpointSlice` objects provide backend endpoints.
//! - `kubernetes.io/tls` `Secret`s referenced from Ingress `tls` sections provide certificates.
//! - An optional `ConfigMap` provides operator-wide annotation defaults.
//!
//! ```text
//! [ Ingress ] -> [ Service ] <- [ EndpointSlice ]
//!      \-> [ Secret ]
//! ```
//!
//! The index does not build configurations itself; it publishes a generation number whenever a
//! relevant resource changes and hands out consistent snapshots to the reconciler.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod builder;
mod index;
pub mod metrics;
pub mod tls;

#[cfg(test)]
mod tests;

pub use self::{
    builder::{build, BuildError, Resources},
    index::{Index, SharedIndex, Snapshot},
    tls::{CertificateRef, TlsSecrets},
};
