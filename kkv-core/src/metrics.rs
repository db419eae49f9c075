//! Metric sink capability set.
//!
//! The client never talks to a metrics library directly. It calls a
//! [`MetricSink`] with one of the metric identifiers below plus the label
//! values for that metric, in the order given by `label_names`.

/// Gauges published by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaugeMetric {
    /// Highest confirmed offset per partition.
    LastSeenOffset,
}

impl GaugeMetric {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LastSeenOffset => "kafka_key_value_last_seen_offset",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Self::LastSeenOffset => "Highest log offset confirmed by the cache, per partition",
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            Self::LastSeenOffset => &["cache_host", "topic", "partition"],
        }
    }
}

/// Counters published by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterMetric {
    /// Labels: topic, outcome (`success`, `status_<code>`, `transport_error`).
    PutAttempts,
    StreamRecords,
    MalformedRecords,
    UpdatesDispatched,
}

impl CounterMetric {
    pub const ALL: [CounterMetric; 4] = [
        Self::PutAttempts,
        Self::StreamRecords,
        Self::MalformedRecords,
        Self::UpdatesDispatched,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PutAttempts => "kafka_key_value_put_attempts_total",
            Self::StreamRecords => "kafka_key_value_stream_records_total",
            Self::MalformedRecords => "kafka_key_value_malformed_records_total",
            Self::UpdatesDispatched => "kafka_key_value_updates_dispatched_total",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Self::PutAttempts => "Write attempts sent to the proxy",
            Self::StreamRecords => "Records decoded from bulk value streams",
            Self::MalformedRecords => "Stream lines skipped because they were not valid JSON",
            Self::UpdatesDispatched => "Debounced update handler dispatches",
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            Self::PutAttempts => &["topic", "outcome"],
            Self::StreamRecords | Self::MalformedRecords | Self::UpdatesDispatched => &["topic"],
        }
    }
}

/// Latency histograms, all in seconds and labeled by topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistogramMetric {
    PutDuration,
    GetDuration,
    StreamDuration,
}

impl HistogramMetric {
    pub const ALL: [HistogramMetric; 3] =
        [Self::PutDuration, Self::GetDuration, Self::StreamDuration];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PutDuration => "kafka_key_value_put_duration_seconds",
            Self::GetDuration => "kafka_key_value_get_duration_seconds",
            Self::StreamDuration => "kafka_key_value_stream_duration_seconds",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Self::PutDuration => "Time for a logical put including retries",
            Self::GetDuration => "Time for a point read from the cache",
            Self::StreamDuration => "Time to consume a full value stream",
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        &["topic"]
    }
}

/// Destination for client metrics.
pub trait MetricSink: Send + Sync {
    fn set(&self, gauge: GaugeMetric, labels: &[&str], value: f64);

    fn inc_by(&self, counter: CounterMetric, labels: &[&str], n: u64);

    fn inc(&self, counter: CounterMetric, labels: &[&str]) {
        self.inc_by(counter, labels, 1);
    }

    fn observe(&self, histogram: HistogramMetric, labels: &[&str], value: f64);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn set(&self, _gauge: GaugeMetric, _labels: &[&str], _value: f64) {}

    fn inc_by(&self, _counter: CounterMetric, _labels: &[&str], _n: u64) {}

    fn observe(&self, _histogram: HistogramMetric, _labels: &[&str], _value: f64) {}
}
