use crate::SharedIndex;
use ahash::AHashMap as HashMap;
use ingress_controller_core::ResourceId;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::collections::BTreeMap;

#[derive(Debug)]
struct Instrumented(SharedIndex);

/// Reports the number of indexed resources of each kind per namespace.
pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();
        encode_sizes(
            &mut encoder,
            "ingress_index_size",
            "The number of Ingresses in the index",
            &this.ingresses,
        )?;
        encode_sizes(
            &mut encoder,
            "service_index_size",
            "The number of Services in the index",
            &this.services,
        )?;
        encode_sizes(
            &mut encoder,
            "endpoint_slice_index_size",
            "The number of EndpointSlices in the index",
            &this.endpoint_slices,
        )?;
        encode_sizes(
            &mut encoder,
            "tls_secret_index_size",
            "The number of TLS Secrets in the index",
            &this.secrets,
        )
    }
}

fn encode_sizes<T>(
    encoder: &mut DescriptorEncoder<'_>,
    name: &str,
    help: &str,
    resources: &HashMap<ResourceId, T>,
) -> Result<(), std::fmt::Error> {
    let mut by_ns = BTreeMap::<&str, u32>::new();
    for id in resources.keys() {
        *by_ns.entry(id.namespace.as_str()).or_default() += 1;
    }

    let mut family = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
    for (ns, size) in by_ns {
        let labels = vec![("namespace", ns)];
        let gauge = ConstGauge::new(size);
        gauge.encode(family.encode_family(&labels)?)?;
    }
    Ok(())
}
