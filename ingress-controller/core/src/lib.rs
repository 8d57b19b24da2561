#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
mod audit;
pub mod change;
pub mod envelope;
pub mod model;
mod resource_id;

pub use self::{
    audit::{Audit, AuditRecord, TracingAudit},
    change::{compare, endpoint_changes, BackendEndpoints, ChangeClass},
    envelope::{DynamicOp, EnvelopeKind, StreamEnvelope},
    model::{Configuration, ModelError},
    resource_id::ResourceId,
};
