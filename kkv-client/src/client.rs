//! Client facade.
//!
//! [`KkvClient`] wires the retrying writer, the cache reader, the offset
//! tracker and the update dispatcher around one transport and one metric
//! sink.

use crate::codec::{gunzip, GZIP_ENCODING};
use crate::dispatcher::{HandlerId, UpdateDispatcher};
use crate::http::HttpTransport;
use crate::metrics::PrometheusMetrics;
use crate::offsets::OffsetTracker;
use crate::stream::{stream_body_with, StreamSummary, StreamingReader};
use crate::writer::RetryingWriter;
use async_trait::async_trait;
use kkv_core::{
    parse_last_seen_offsets, ClientConfig, CounterMetric, HistogramMetric, KkvError, KkvResult,
    KkvTransport, MetricSink, NotificationSource, Offset, PartitionId, PartitionOffset,
    PutOptions, Value, ValueFetcher, LAST_SEEN_OFFSETS_HEADER,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point and bulk reads against the cache.
pub struct CacheReader {
    transport: Arc<dyn KkvTransport>,
    offsets: Arc<OffsetTracker>,
    metrics: Arc<dyn MetricSink>,
    topic: String,
    max_record_bytes: usize,
}

impl CacheReader {
    pub fn new(
        transport: Arc<dyn KkvTransport>,
        offsets: Arc<OffsetTracker>,
        metrics: Arc<dyn MetricSink>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            offsets,
            metrics,
            topic: topic.into(),
            max_record_bytes: kkv_core::config::DEFAULT_MAX_RECORD_BYTES,
        }
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    /// Read the current value of `key`.
    ///
    /// Gzip-encoded bodies are decompressed. Offsets reported by the cache
    /// are forwarded to the tracker whatever the status.
    pub async fn get(&self, key: &str) -> KkvResult<Value> {
        let started = Instant::now();
        let response = self.transport.read(key).await?;
        self.metrics.observe(
            HistogramMetric::GetDuration,
            &[&self.topic],
            started.elapsed().as_secs_f64(),
        );

        self.record_offsets(response.header(LAST_SEEN_OFFSETS_HEADER));

        if !response.is_ok() {
            return Err(KkvError::UnexpectedStatus {
                operation: "get",
                status: response.status,
            });
        }

        let gzipped = response
            .header("content-encoding")
            .is_some_and(|encoding| encoding.eq_ignore_ascii_case(GZIP_ENCODING));
        let value = if gzipped {
            serde_json::from_slice(&gunzip(&response.body)?)
        } else {
            serde_json::from_slice(&response.body)
        };
        value.map_err(|e| KkvError::invalid_response("get", e))
    }

    /// Consume the bulk value stream, calling `on_record` for every value.
    ///
    /// Offsets from the response header are applied only after the whole
    /// stream has been read, since the values it carries are what those
    /// offsets vouch for.
    pub async fn stream_values<F>(&self, on_record: F) -> KkvResult<StreamSummary>
    where
        F: FnMut(Value),
    {
        let started = Instant::now();
        let response = self.transport.open_value_stream().await?;
        if !response.is_ok() {
            return Err(KkvError::UnexpectedStatus {
                operation: "stream",
                status: response.status,
            });
        }

        let header = response
            .header(LAST_SEEN_OFFSETS_HEADER)
            .map(str::to_string);
        let reader = StreamingReader::with_max_line_bytes(self.max_record_bytes);
        let summary = stream_body_with(reader, response.body, on_record).await?;

        self.record_offsets(header.as_deref());
        self.metrics
            .inc_by(CounterMetric::StreamRecords, &[&self.topic], summary.records);
        self.metrics
            .inc_by(CounterMetric::MalformedRecords, &[&self.topic], summary.malformed);
        self.metrics.observe(
            HistogramMetric::StreamDuration,
            &[&self.topic],
            started.elapsed().as_secs_f64(),
        );

        info!(
            topic = %self.topic,
            records = summary.records,
            malformed = summary.malformed,
            "Value stream consumed"
        );
        Ok(summary)
    }

    fn record_offsets(&self, header: Option<&str>) {
        let Some(header) = header else {
            return;
        };
        match parse_last_seen_offsets(header, &self.topic) {
            Ok(offsets) => {
                let published = self.offsets.update_partition_offset_metrics(&offsets);
                debug!(partitions = offsets.len(), published = published, "Applied last-seen offsets");
            }
            Err(err) => {
                warn!(error = %err, "Ignoring unparseable last-seen-offsets header");
            }
        }
    }
}

#[async_trait]
impl ValueFetcher for CacheReader {
    async fn fetch(&self, key: &str) -> KkvResult<Value> {
        self.get(key).await
    }
}

pub struct KkvClient {
    config: ClientConfig,
    writer: RetryingWriter,
    reader: Arc<CacheReader>,
    offsets: Arc<OffsetTracker>,
    dispatcher: UpdateDispatcher,
}

impl KkvClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn KkvTransport>,
        metrics: Arc<dyn MetricSink>,
    ) -> KkvResult<Self> {
        config.validate()?;

        let topic = config.topic_name.clone();
        let offsets = Arc::new(OffsetTracker::new(
            config.cache_host_label(),
            topic.clone(),
            Arc::clone(&metrics),
        ));
        let writer = RetryingWriter::new(
            Arc::clone(&transport),
            Arc::clone(&metrics),
            topic.clone(),
            config.put,
        )
        .with_gzip(config.gzip_payloads);
        let reader = Arc::new(
            CacheReader::new(
                transport,
                Arc::clone(&offsets),
                Arc::clone(&metrics),
                topic.clone(),
            )
            .with_max_record_bytes(config.max_record_bytes),
        );
        let dispatcher = UpdateDispatcher::new(
            topic,
            config.debounce_window(),
            reader.clone(),
            Arc::clone(&offsets),
            metrics,
        );

        Ok(Self {
            config,
            writer,
            reader,
            offsets,
            dispatcher,
        })
    }

    /// Client over HTTP reporting to the process-wide Prometheus registry.
    pub fn from_config(config: ClientConfig) -> KkvResult<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let metrics: Arc<PrometheusMetrics> = match crate::metrics::METRICS.as_ref() {
            Ok(metrics) => Arc::new(metrics.clone()),
            Err(err) => return Err(err.clone()),
        };
        Self::new(config, transport, metrics)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.config.topic_name
    }

    pub async fn put<V>(&self, key: &str, value: &V, options: Option<PutOptions>) -> KkvResult<Offset>
    where
        V: Serialize + ?Sized,
    {
        self.writer.put(key, value, options).await
    }

    pub async fn get(&self, key: &str) -> KkvResult<Value> {
        self.reader.get(key).await
    }

    pub async fn stream_values<F>(&self, on_record: F) -> KkvResult<StreamSummary>
    where
        F: FnMut(Value),
    {
        self.reader.stream_values(on_record).await
    }

    pub fn on_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.dispatcher.on_update(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.dispatcher.remove_handler(id)
    }

    pub fn update_partition_offset_metrics(&self, offsets: &HashMap<PartitionId, Offset>) -> usize {
        self.offsets.update_partition_offset_metrics(offsets)
    }

    pub fn last_seen_offsets(&self) -> Vec<PartitionOffset> {
        self.offsets.snapshot()
    }

    pub fn dispatcher(&self) -> &UpdateDispatcher {
        &self.dispatcher
    }

    /// Start dispatching updates from `source`. Returns `false` if already started.
    pub fn start(&self, source: &dyn NotificationSource) -> bool {
        self.dispatcher.start(source)
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
