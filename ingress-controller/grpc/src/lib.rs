//! Delivers ingress configurations to a data-plane worker over a bidirectional gRPC stream.
//!
//! The controller writes [`proto::Envelope`]s carrying either a complete configuration or a
//! named incremental operation; the worker answers each with [`proto::Feedback`]. See
//! [`Distributor`] for the delivery guarantees.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connect;
mod distributor;
mod metrics;
pub mod proto;

pub use self::{
    connect::{Connect, ConnectorError, FeedbackStream, GrpcConnector, WORKER_HEADER},
    distributor::{
        ApplyError, ApplyStatus, Backoff, Config, Distributor, DistributorError, NoReload, Reload,
    },
    metrics::DistributorMetrics,
};
