//! Prometheus metric sink.

use kkv_core::{CounterMetric, GaugeMetric, HistogramMetric, KkvError, KkvResult, MetricSink};
use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use tracing::warn;

/// Latency buckets (seconds). Put durations include retry sleeps, so the
/// range runs well past a single request.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Client metrics registered with the process-wide default registry.
pub static METRICS: Lazy<KkvResult<PrometheusMetrics>> =
    Lazy::new(|| PrometheusMetrics::with_registry(prometheus::default_registry()));

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    gauges: HashMap<GaugeMetric, GaugeVec>,
    counters: HashMap<CounterMetric, CounterVec>,
    histograms: HashMap<HistogramMetric, HistogramVec>,
}

impl PrometheusMetrics {
    /// Create every client metric and register it with `registry`.
    pub fn with_registry(registry: &Registry) -> KkvResult<Self> {
        let mut gauges = HashMap::new();
        let gauge = GaugeMetric::LastSeenOffset;
        let vec = GaugeVec::new(Opts::new(gauge.name(), gauge.help()), gauge.label_names())
            .map_err(|e| registration_error(gauge.name(), e))?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|e| registration_error(gauge.name(), e))?;
        gauges.insert(gauge, vec);

        let mut counters = HashMap::new();
        for counter in CounterMetric::ALL {
            let vec = CounterVec::new(
                Opts::new(counter.name(), counter.help()),
                counter.label_names(),
            )
            .map_err(|e| registration_error(counter.name(), e))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| registration_error(counter.name(), e))?;
            counters.insert(counter, vec);
        }

        let mut histograms = HashMap::new();
        for histogram in HistogramMetric::ALL {
            let opts = HistogramOpts::new(histogram.name(), histogram.help())
                .buckets(LATENCY_BUCKETS.to_vec());
            let vec = HistogramVec::new(opts, histogram.label_names())
                .map_err(|e| registration_error(histogram.name(), e))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| registration_error(histogram.name(), e))?;
            histograms.insert(histogram, vec);
        }

        Ok(Self {
            registry: registry.clone(),
            gauges,
            counters,
            histograms,
        })
    }

    /// Metrics on a fresh private registry.
    pub fn new() -> KkvResult<Self> {
        Self::with_registry(&Registry::new())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> KkvResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| KkvError::Metrics {
                reason: format!("Failed to encode metrics: {}", e),
            })?;
        String::from_utf8(buffer).map_err(|e| KkvError::Metrics {
            reason: e.to_string(),
        })
    }
}

impl MetricSink for PrometheusMetrics {
    fn set(&self, gauge: GaugeMetric, labels: &[&str], value: f64) {
        let Some(vec) = self.gauges.get(&gauge) else {
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(metric) => metric.set(value),
            Err(e) => warn!(metric = gauge.name(), error = %e, "Dropping gauge update"),
        }
    }

    fn inc_by(&self, counter: CounterMetric, labels: &[&str], n: u64) {
        let Some(vec) = self.counters.get(&counter) else {
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(metric) => metric.inc_by(n as f64),
            Err(e) => warn!(metric = counter.name(), error = %e, "Dropping counter increment"),
        }
    }

    fn observe(&self, histogram: HistogramMetric, labels: &[&str], value: f64) {
        let Some(vec) = self.histograms.get(&histogram) else {
            return;
        };
        match vec.get_metric_with_label_values(labels) {
            Ok(metric) => metric.observe(value),
            Err(e) => warn!(metric = histogram.name(), error = %e, "Dropping observation"),
        }
    }
}

fn registration_error(name: &str, err: prometheus::Error) -> KkvError {
    KkvError::Metrics {
        reason: format!("Failed to register {}: {}", name, err),
    }
}
