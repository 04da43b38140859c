use pacemaker_daemon_core::Outcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct WaitMetrics {
    wait_duration: Histogram,
    pod_not_found: Counter,
    failed: Family<FailedLabels, Counter>,
    inflight: Gauge,
}

/// Tracks a single request from its start until it is dropped.
pub(crate) struct WaitObserver {
    start: time::Instant,
    metrics: WaitMetrics,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FailedLabels {
    reason: &'static str,
}

// === impl WaitMetrics ===

impl WaitMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        // Waits range from instant grants to the full CNI timeout.
        let wait_duration = Histogram::new(exponential_buckets(0.1, 5.0, 5));
        reg.register_with_unit(
            "wait_duration",
            "Duration of wait requests that were granted a slot",
            Unit::Seconds,
            wait_duration.clone(),
        );

        let pod_not_found = Counter::default();
        reg.register(
            "pod_not_found",
            "Total number of pod lookups that did not find the waiting pod",
            pod_not_found.clone(),
        );

        let failed = Family::<FailedLabels, Counter>::default();
        reg.register(
            "wait_failed",
            "Total number of wait requests that were not granted a slot",
            failed.clone(),
        );

        let inflight = Gauge::default();
        reg.register(
            "inflight",
            "Number of wait requests currently being processed",
            inflight.clone(),
        );

        Self {
            wait_duration,
            pod_not_found,
            failed,
            inflight,
        }
    }

    pub(crate) fn start(&self) -> WaitObserver {
        self.inflight.inc();
        WaitObserver {
            start: time::Instant::now(),
            metrics: self.clone(),
        }
    }

    pub(crate) fn pod_not_found(&self) {
        self.pod_not_found.inc();
    }
}

impl Default for WaitMetrics {
    /// Metrics that are not exported anywhere.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl WaitObserver ===

impl WaitObserver {
    pub(crate) fn elapsed(&self) -> time::Duration {
        self.start.elapsed()
    }

    pub(crate) fn end(&self, outcome: &Outcome) {
        match outcome.failure_reason() {
            Some(reason) => {
                self.metrics.failed.get_or_create(&FailedLabels { reason }).inc();
            }
            None => self
                .metrics
                .wait_duration
                .observe(self.elapsed().as_secs_f64()),
        }
    }
}

impl Drop for WaitObserver {
    fn drop(&mut self) {
        self.metrics.inflight.dec();
    }
}
