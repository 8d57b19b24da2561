use crate::DistributorError;
use ingress_controller_core::EnvelopeKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct DistributorMetrics {
    envelopes: Family<EnvelopeLabels, Counter>,
    reconnects: Counter,
    errors: Family<ErrorLabels, Counter>,
    connected: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct EnvelopeLabels {
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ErrorLabels {
    error: &'static str,
}

// === impl DistributorMetrics ===

impl DistributorMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let envelopes = Family::<EnvelopeLabels, Counter>::default();
        reg.register(
            "envelopes_sent",
            "Total number of envelopes written to the data-plane stream",
            envelopes.clone(),
        );

        let reconnects = Counter::default();
        reg.register(
            "reconnects",
            "Total number of data-plane connection attempts after the first",
            reconnects.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        reg.register(
            "errors",
            "Total number of errors reported by the distributor",
            errors.clone(),
        );

        let connected = Gauge::default();
        reg.register(
            "connected",
            "Whether the data-plane stream is connected",
            connected.clone(),
        );

        Self {
            envelopes,
            reconnects,
            errors,
            connected,
        }
    }

    pub(crate) fn sent(&self, kind: EnvelopeKind) {
        self.envelopes
            .get_or_create(&EnvelopeLabels {
                kind: kind.as_str(),
            })
            .inc();
    }

    pub(crate) fn reconnecting(&self) {
        self.reconnects.inc();
    }

    pub(crate) fn error(&self, error: &DistributorError) {
        self.errors
            .get_or_create(&ErrorLabels {
                error: error.as_label(),
            })
            .inc();
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.set(i64::from(connected));
    }
}
