//! Prometheus metrics for the controller and its work queues.

use std::sync::LazyLock;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Opts,
};

/// Total number of Kong apis owned by the controller
pub static APIS_TOTAL: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::with_opts(
        Opts::new("total_kong_apis", "Total number of Kong apis")
            .namespace("kong_ingress")
            .subsystem("controller"),
    )
    .unwrap();
    let _ = prometheus::register(Box::new(gauge.clone()));
    gauge
});

/// Total number of requests that failed on creating a new api on Kong
pub static APIS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new(
            "apis_failed",
            "Total number of requests that failed on creating a new api on Kong",
        )
        .namespace("kong_ingress")
        .subsystem("controller"),
    )
    .unwrap();
    let _ = prometheus::register(Box::new(counter.clone()));
    counter
});

/// Per-queue metrics, namespaced by the queue name.
///
/// Registration failures are ignored: tests create queues with repeated
/// names and duplicate collectors simply aren't exported twice.
#[derive(Clone)]
pub struct QueueMetrics {
    /// Current depth of the queue
    pub depth: IntGauge,
    /// Total number of adds handled by the queue
    pub adds: IntCounter,
    /// Total number of retries handled by the queue
    pub retries: IntCounter,
    /// How long an item stays queued before being requested, in seconds
    pub latency: Histogram,
    /// How long processing an item takes, in seconds
    pub work_duration: Histogram,
}

impl QueueMetrics {
    /// Build and register the metric set for the queue called `name`
    pub fn new(name: &str) -> Self {
        let depth = IntGauge::with_opts(
            Opts::new("depth", format!("Current depth of workqueue: {name}")).subsystem(name),
        )
        .unwrap();
        let adds = IntCounter::with_opts(
            Opts::new(
                "adds",
                format!("Total number of adds handled by workqueue: {name}"),
            )
            .subsystem(name),
        )
        .unwrap();
        let retries = IntCounter::with_opts(
            Opts::new(
                "retries",
                format!("Total number of retries handled by workqueue: {name}"),
            )
            .subsystem(name),
        )
        .unwrap();
        let latency = Histogram::with_opts(HistogramOpts {
            common_opts: Opts::new(
                "queue_latency",
                format!("How long an item stays in workqueue {name} before being requested"),
            )
            .subsystem(name),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        })
        .unwrap();
        let work_duration = Histogram::with_opts(HistogramOpts {
            common_opts: Opts::new(
                "work_duration",
                format!("How long processing an item from workqueue {name} takes"),
            )
            .subsystem(name),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        })
        .unwrap();

        for collector in [
            Box::new(depth.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(adds.clone()),
            Box::new(retries.clone()),
            Box::new(latency.clone()),
            Box::new(work_duration.clone()),
        ] {
            let _ = prometheus::register(collector);
        }

        Self {
            depth,
            adds,
            retries,
            latency,
            work_duration,
        }
    }
}
