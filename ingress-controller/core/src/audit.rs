use crate::{annotations::Source, ResourceId};

/// Records the resolution of a critical annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    pub resource: ResourceId,
    pub annotation: &'static str,
    pub value: String,
    pub source: Source,
}

/// Receives audit records. Emission is fire-and-forget and may happen from many resolutions at
/// once.
pub trait Audit: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes audit records to the `audit` log target.
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingAudit;

impl Audit for TracingAudit {
    fn record(&self, record: AuditRecord) {
        let AuditRecord {
            resource,
            annotation,
            value,
            source,
        } = record;
        tracing::info!(
            target: "audit",
            namespace = %resource.namespace,
            name = %resource.name,
            annotation,
            %value,
            ?source,
            "Critical annotation resolved"
        );
    }
}
