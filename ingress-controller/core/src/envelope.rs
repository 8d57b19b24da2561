use crate::{change::BackendEndpoints, model::Configuration};
use serde::Serialize;
use std::{fmt, sync::Arc};

/// A unit of configuration shipped to a data-plane worker.
///
/// Versions increase monotonically per distributor; peer feedback refers to them.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEnvelope {
    /// The complete configuration. Workers apply it atomically once fully received.
    FullConfig {
        version: u64,
        configuration: Arc<Configuration>,
    },

    /// A named partial mutation of the last configuration the worker received.
    Incremental { version: u64, op: DynamicOp },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    FullConfig,
    Incremental,
}

/// A mutation that can be applied without reloading the proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DynamicOp {
    UpdateEndpoints { backends: Vec<BackendEndpoints> },
}

// === impl StreamEnvelope ===

impl StreamEnvelope {
    pub fn version(&self) -> u64 {
        match self {
            Self::FullConfig { version, .. } | Self::Incremental { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::FullConfig { .. } => EnvelopeKind::FullConfig,
            Self::Incremental { .. } => EnvelopeKind::Incremental,
        }
    }
}

// === impl EnvelopeKind ===

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullConfig => "full_config",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl DynamicOp ===

impl DynamicOp {
    /// The operation name workers dispatch on.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateEndpoints { .. } => "update-endpoints",
        }
    }

    /// The JSON body of the operation.
    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
