//! Retrying write path.
//!
//! The write proxy is expected to be briefly unavailable during rollouts, so a
//! logical `put` keeps re-sending the same body until the proxy answers 200 or
//! the attempt budget runs out. Connection errors and every non-200 status
//! count the same way against the budget.

use crate::codec::compress_gzip_payload;
use bytes::Bytes;
use kkv_core::{
    CounterMetric, HistogramMetric, KkvError, KkvResult, KkvTransport, MetricSink, Offset,
    PutOptions, WriteReceipt, WriteRequest,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub struct RetryingWriter {
    transport: Arc<dyn KkvTransport>,
    metrics: Arc<dyn MetricSink>,
    topic: String,
    gzip: bool,
    defaults: PutOptions,
}

impl RetryingWriter {
    pub fn new(
        transport: Arc<dyn KkvTransport>,
        metrics: Arc<dyn MetricSink>,
        topic: impl Into<String>,
        defaults: PutOptions,
    ) -> Self {
        Self {
            transport,
            metrics,
            topic: topic.into(),
            gzip: false,
            defaults,
        }
    }

    pub fn with_gzip(mut self, enabled: bool) -> Self {
        self.gzip = enabled;
        self
    }

    pub fn defaults(&self) -> PutOptions {
        self.defaults
    }

    /// Write `value` under `key` and return the offset the log assigned.
    ///
    /// `options` overrides the configured retry budget for this call only.
    pub async fn put<V>(&self, key: &str, value: &V, options: Option<PutOptions>) -> KkvResult<Offset>
    where
        V: Serialize + ?Sized,
    {
        let options = options.unwrap_or(self.defaults);
        let body = self.encode(value)?;
        let started = Instant::now();
        let max_attempts = options.max_attempts();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let request = WriteRequest {
                topic: self.topic.clone(),
                key: key.to_string(),
                body: body.clone(),
                gzip: self.gzip,
            };

            match self.transport.write(request).await {
                Ok(response) if response.is_ok() => {
                    self.metrics
                        .inc(CounterMetric::PutAttempts, &[&self.topic, "success"]);
                    self.observe_duration(started);

                    let receipt: WriteReceipt = serde_json::from_slice(&response.body)
                        .map_err(|e| KkvError::invalid_response("put", e))?;
                    debug!(
                        topic = %self.topic,
                        key = key,
                        offset = receipt.offset,
                        attempts = attempts,
                        "Write acknowledged"
                    );
                    return Ok(receipt.offset);
                }
                Ok(response) => {
                    let outcome = format!("status_{}", response.status);
                    self.metrics
                        .inc(CounterMetric::PutAttempts, &[&self.topic, &outcome]);
                    warn!(
                        topic = %self.topic,
                        key = key,
                        status = response.status,
                        attempt = attempts,
                        max_attempts = max_attempts,
                        "Write rejected by proxy"
                    );
                }
                Err(err) => {
                    self.metrics
                        .inc(CounterMetric::PutAttempts, &[&self.topic, "transport_error"]);
                    warn!(
                        topic = %self.topic,
                        key = key,
                        error = %err,
                        attempt = attempts,
                        max_attempts = max_attempts,
                        "Write attempt failed"
                    );
                }
            }

            if attempts >= max_attempts {
                self.observe_duration(started);
                error!(topic = %self.topic, key = key, attempts = attempts, "Giving up on write");
                return Err(KkvError::RetryExhausted {
                    topic: self.topic.clone(),
                    attempts,
                });
            }

            tokio::time::sleep(options.interval()).await;
        }
    }

    fn encode<V>(&self, value: &V) -> KkvResult<Bytes>
    where
        V: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(|e| KkvError::Codec {
            reason: e.to_string(),
        })?;
        if self.gzip {
            Ok(Bytes::from(compress_gzip_payload(&payload)?))
        } else {
            Ok(Bytes::from(payload))
        }
    }

    fn observe_duration(&self, started: Instant) {
        self.metrics.observe(
            HistogramMetric::PutDuration,
            &[&self.topic],
            started.elapsed().as_secs_f64(),
        );
    }
}
