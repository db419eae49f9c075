//! KKV Client
//!
//! Client for a key-value store journaled in a partitioned log and served
//! through a read-through cache:
//! - Writes go through a proxy and are retried until acknowledged
//! - Bulk reads stream newline-delimited JSON from the cache
//! - Change notifications are debounced per key into single value reads
//! - The highest confirmed log offset per partition is published as a gauge

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod events;
pub mod http;
pub mod metrics;
pub mod offsets;
pub mod stream;
pub mod telemetry;
pub mod writer;

pub use client::{CacheReader, KkvClient};
pub use codec::{compress_gzip_payload, decompress_gzip_response};
pub use dispatcher::{HandlerId, UpdateDispatcher, UpdateHandler};
pub use events::UpdateEvents;
pub use http::HttpTransport;
pub use metrics::{PrometheusMetrics, METRICS};
pub use offsets::OffsetTracker;
pub use stream::{stream_body, stream_body_with, StreamSummary, StreamingReader};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use writer::RetryingWriter;

pub use kkv_core::{
    ChangeNotification, ClientConfig, KkvError, KkvResult, Offset, PutOptions, Value,
};
