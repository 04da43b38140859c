use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of pods on this node in the index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.by_ns {
            let labels = [("namespace", ns.as_str())];
            let pods = ConstGauge::new(index.pods.len() as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        Ok(())
    }
}
