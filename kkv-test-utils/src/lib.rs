//! KKV Test Utilities
//!
//! Shared test infrastructure for the KKV workspace:
//! - Recording metric sink
//! - Scripted transport and value fetcher
//! - Notification fixtures
//! - Proptest generators for records and chunk boundaries

pub use kkv_core::{
    ChangeNotification, ClientConfig, CounterMetric, GaugeMetric, HistogramMetric, KkvError,
    KkvResult, MetricSink, PutOptions, StreamingResponse, TransportResponse, Value, WriteRequest,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use kkv_core::{KkvTransport, ValueFetcher};
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub const TEST_CACHE_HOST: &str = "http://cache-kkv";
pub const TEST_PROXY_HOST: &str = "http://pixy";
pub const TEST_TOPIC: &str = "testtopic01";

/// Client configuration pointing at the fake hosts used across tests.
pub fn test_config() -> ClientConfig {
    ClientConfig::new(TEST_CACHE_HOST, TEST_PROXY_HOST, TEST_TOPIC)
}

// ============================================================================
// METRICS
// ============================================================================

/// One call made against a [`RecordingMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Set {
        gauge: GaugeMetric,
        labels: Vec<String>,
        value: f64,
    },
    Inc {
        counter: CounterMetric,
        labels: Vec<String>,
        by: u64,
    },
    Observe {
        histogram: HistogramMetric,
        labels: Vec<String>,
        value: f64,
    },
}

/// Metric sink that remembers every call, in order.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().expect("metrics lock").clone()
    }

    /// Every `set` on `gauge` as (labels, value), in call order.
    pub fn gauge_sets(&self, gauge: GaugeMetric) -> Vec<(Vec<String>, f64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::Set {
                    gauge: g,
                    labels,
                    value,
                } if g == gauge => Some((labels, value)),
                _ => None,
            })
            .collect()
    }

    /// Sum of increments on `counter` whose labels start with `labels`.
    pub fn counter_total(&self, counter: CounterMetric, labels: &[&str]) -> usize {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::Inc {
                    counter: c,
                    labels: l,
                    by,
                } if c == counter
                    && l.len() >= labels.len()
                    && l.iter().zip(labels).all(|(a, b)| a == b) =>
                {
                    Some(by as usize)
                }
                _ => None,
            })
            .sum()
    }

    /// Number of separate increment calls on `counter`.
    pub fn counter_calls(&self, counter: CounterMetric) -> usize {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, MetricEvent::Inc { counter: c, .. } if *c == counter))
            .count()
    }

    pub fn observations(&self, histogram: HistogramMetric) -> usize {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, MetricEvent::Observe { histogram: h, .. } if *h == histogram))
            .count()
    }

    fn push(&self, event: MetricEvent) {
        self.events.lock().expect("metrics lock").push(event);
    }
}

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|l| l.to_string()).collect()
}

impl MetricSink for RecordingMetrics {
    fn set(&self, gauge: GaugeMetric, labels: &[&str], value: f64) {
        self.push(MetricEvent::Set {
            gauge,
            labels: owned(labels),
            value,
        });
    }

    fn inc_by(&self, counter: CounterMetric, labels: &[&str], n: u64) {
        self.push(MetricEvent::Inc {
            counter,
            labels: owned(labels),
            by: n,
        });
    }

    fn observe(&self, histogram: HistogramMetric, labels: &[&str], value: f64) {
        self.push(MetricEvent::Observe {
            histogram,
            labels: owned(labels),
            value,
        });
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Response for a successful proxy write.
pub fn write_ok(offset: i64) -> TransportResponse {
    TransportResponse::new(200, json!({ "offset": offset }).to_string())
}

/// Failed proxy write with an empty, unparseable body.
pub fn write_failed(status: u16) -> TransportResponse {
    TransportResponse::new(status, Bytes::new())
}

/// Sending half of a scripted value stream.
pub struct StreamFeeder {
    tx: Option<mpsc::UnboundedSender<KkvResult<Bytes>>>,
}

impl StreamFeeder {
    pub fn send(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(chunk.into()));
        }
    }

    pub fn fail(&self, error: KkvError) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(error));
        }
    }

    /// End the stream.
    pub fn finish(&mut self) {
        self.tx.take();
    }
}

/// Build a streaming body fed from a [`StreamFeeder`].
pub fn fed_stream(status: u16) -> (StreamFeeder, StreamingResponse) {
    let (tx, rx) = mpsc::unbounded_channel();
    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (
        StreamFeeder { tx: Some(tx) },
        StreamingResponse::new(status, Box::pin(body)),
    )
}

/// Build a streaming body that yields `chunks` and then ends.
pub fn chunked_stream<I, C>(status: u16, chunks: I) -> StreamingResponse
where
    I: IntoIterator<Item = C>,
    C: Into<Bytes>,
{
    let items: Vec<KkvResult<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
    StreamingResponse::new(status, Box::pin(stream::iter(items)))
}

/// Transport with scripted responses.
///
/// Writes are served from a queue; once it is empty the fallback response
/// (if any) is repeated. Reads are served per key the same way. Streams are
/// handed out in the order they were queued.
#[derive(Default)]
pub struct MockTransport {
    writes: Mutex<VecDeque<KkvResult<TransportResponse>>>,
    write_fallback: Mutex<Option<KkvResult<TransportResponse>>>,
    write_requests: Mutex<Vec<WriteRequest>>,
    reads: Mutex<HashMap<String, VecDeque<KkvResult<TransportResponse>>>>,
    read_fallback: Mutex<HashMap<String, TransportResponse>>,
    read_calls: AtomicUsize,
    streams: Mutex<VecDeque<StreamingResponse>>,
    stream_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_write(&self, response: TransportResponse) -> &Self {
        self.writes.lock().expect("writes lock").push_back(Ok(response));
        self
    }

    pub fn push_write_error(&self, error: KkvError) -> &Self {
        self.writes.lock().expect("writes lock").push_back(Err(error));
        self
    }

    /// Response returned for every write once the queue is drained.
    pub fn always_write(&self, response: TransportResponse) -> &Self {
        *self.write_fallback.lock().expect("fallback lock") = Some(Ok(response));
        self
    }

    pub fn push_read(&self, key: &str, response: TransportResponse) -> &Self {
        self.reads
            .lock()
            .expect("reads lock")
            .entry(key.to_string())
            .or_default()
            .push_back(Ok(response));
        self
    }

    pub fn push_read_error(&self, key: &str, error: KkvError) -> &Self {
        self.reads
            .lock()
            .expect("reads lock")
            .entry(key.to_string())
            .or_default()
            .push_back(Err(error));
        self
    }

    /// Response returned for every read of `key` once its queue is drained.
    pub fn always_read(&self, key: &str, response: TransportResponse) -> &Self {
        self.read_fallback
            .lock()
            .expect("read fallback lock")
            .insert(key.to_string(), response);
        self
    }

    pub fn push_stream(&self, response: StreamingResponse) -> &Self {
        self.streams.lock().expect("streams lock").push_back(response);
        self
    }

    pub fn write_calls(&self) -> usize {
        self.write_requests.lock().expect("requests lock").len()
    }

    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.write_requests.lock().expect("requests lock").clone()
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KkvTransport for MockTransport {
    async fn write(&self, request: WriteRequest) -> KkvResult<TransportResponse> {
        self.write_requests
            .lock()
            .expect("requests lock")
            .push(request);

        if let Some(next) = self.writes.lock().expect("writes lock").pop_front() {
            return next;
        }
        self.write_fallback
            .lock()
            .expect("fallback lock")
            .clone()
            .unwrap_or_else(|| Err(KkvError::transport("write", "no scripted response")))
    }

    async fn read(&self, key: &str) -> KkvResult<TransportResponse> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);

        let queued = self
            .reads
            .lock()
            .expect("reads lock")
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        if let Some(next) = queued {
            return next;
        }
        self.read_fallback
            .lock()
            .expect("read fallback lock")
            .get(key)
            .cloned()
            .map(Ok)
            .unwrap_or_else(|| Ok(TransportResponse::new(404, Bytes::new())))
    }

    async fn open_value_stream(&self) -> KkvResult<StreamingResponse> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .expect("streams lock")
            .pop_front()
            .ok_or_else(|| KkvError::transport("stream", "no scripted stream"))
    }
}

// ============================================================================
// VALUE FETCHER
// ============================================================================

/// Fetcher returning whatever value is currently set for a key.
///
/// Tests mutate values between notifications to observe which value a
/// debounced dispatch resolves to.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    values: Mutex<HashMap<String, Value>>,
    failing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, key: &str, value: Value) {
        self.values
            .lock()
            .expect("values lock")
            .insert(key.to_string(), value);
    }

    /// Make every fetch of `key` fail with a transport error.
    pub fn fail_key(&self, key: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .push(key.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }
}

#[async_trait]
impl ValueFetcher for ScriptedFetcher {
    async fn fetch(&self, key: &str) -> KkvResult<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(key.to_string());

        if self
            .failing
            .lock()
            .expect("failing lock")
            .iter()
            .any(|k| k == key)
        {
            return Err(KkvError::transport("get", "scripted failure"));
        }

        Ok(self
            .values
            .lock()
            .expect("values lock")
            .get(key)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// v1 notification touching one key at one partition offset.
pub fn notification(topic: &str, key: &str, partition: &str, offset: i64) -> ChangeNotification {
    ChangeNotification::new(topic)
        .with_offset(partition, offset)
        .with_update(key)
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Flat JSON objects with string, integer and boolean fields.
pub fn record_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        "[a-z]{1,8}",
        prop_oneof![
            "[ -~]{0,12}".prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ],
        0..5,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect()))
}

/// Records plus cut points for splitting their newline-delimited encoding.
pub fn records_and_cuts() -> impl Strategy<Value = (Vec<Value>, Vec<usize>)> {
    prop::collection::vec(record_strategy(), 0..8).prop_flat_map(|records| {
        let len = encode_ndjson(&records).len();
        let cuts = prop::collection::vec(0..=len, 0..12);
        (Just(records), cuts)
    })
}

/// Newline-delimited JSON encoding of `records`.
pub fn encode_ndjson(records: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(record.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

/// Split `bytes` at the given positions (sorted and deduplicated first).
pub fn split_at_cuts(bytes: &[u8], cuts: &[usize]) -> Vec<Bytes> {
    let mut cuts: Vec<usize> = cuts.iter().copied().filter(|c| *c <= bytes.len()).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        chunks.push(Bytes::copy_from_slice(&bytes[start..cut]));
        start = cut;
    }
    chunks.push(Bytes::copy_from_slice(&bytes[start..]));
    chunks
}
