//! KKV Core - Data Types and Seams
//!
//! Plain data structures shared by the client and its test doubles, plus the
//! traits at which the client meets the outside world (transport, metrics,
//! notification bus). This crate contains no network or timer logic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub mod config;
pub mod error;
pub mod metrics;
pub mod transport;

pub use config::{ClientConfig, PutOptions};
pub use error::{ConfigError, KkvError, KkvResult};
pub use metrics::{CounterMetric, GaugeMetric, HistogramMetric, MetricSink, NoopMetrics};
pub use transport::{
    ByteStream, KkvTransport, NotificationSource, StreamingResponse, TransportResponse,
    ValueFetcher, WriteRequest,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Opaque record key, unique within a topic.
pub type Key = String;

/// Arbitrary JSON payload stored under a key.
pub type Value = serde_json::Value;

/// Partition identifier as it appears in notification offset maps.
pub type PartitionId = String;

/// Position within a single partition.
pub type Offset = i64;

/// Response header carrying the cache's last consumed offsets.
pub const LAST_SEEN_OFFSETS_HEADER: &str = "x-kkv-last-seen-offsets";

/// The only change notification schema version this client understands.
pub const NOTIFICATION_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// LOG POSITIONS
// ============================================================================

/// A (partition, offset) pair. Offsets are only comparable within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub partition: PartitionId,
    pub offset: Offset,
}

impl PartitionOffset {
    pub fn new(partition: impl Into<PartitionId>, offset: Offset) -> Self {
        Self {
            partition: partition.into(),
            offset,
        }
    }
}

/// One entry of the `x-kkv-last-seen-offsets` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeenOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
}

/// Parse the last-seen-offsets header and keep the entries for `topic`.
///
/// The header value is a JSON array of `{topic, partition, offset}` objects.
/// Partitions are returned keyed by their decimal string form so they line up
/// with the keys used in change notifications.
pub fn parse_last_seen_offsets(
    header: &str,
    topic: &str,
) -> KkvResult<HashMap<PartitionId, Offset>> {
    let entries: Vec<LastSeenOffset> =
        serde_json::from_str(header).map_err(|e| KkvError::InvalidResponse {
            operation: "last_seen_offsets",
            reason: e.to_string(),
        })?;

    Ok(entries
        .into_iter()
        .filter(|entry| entry.topic == topic)
        .map(|entry| (entry.partition.to_string(), entry.offset))
        .collect())
}

// ============================================================================
// CHANGE NOTIFICATIONS
// ============================================================================

/// Change notification published on the process-wide update bus.
///
/// `offsets` is the log position after the change; `updates` names the keys
/// that were touched. The payloads under `updates` are not trusted as values,
/// the dispatcher always reads the current value back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub v: u32,
    pub topic: String,
    #[serde(default)]
    pub offsets: HashMap<PartitionId, Offset>,
    #[serde(default)]
    pub updates: BTreeMap<Key, Value>,
}

impl ChangeNotification {
    /// Create a v1 notification for `topic` with no offsets or keys.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            v: NOTIFICATION_SCHEMA_VERSION,
            topic: topic.into(),
            offsets: HashMap::new(),
            updates: BTreeMap::new(),
        }
    }

    pub fn with_offset(mut self, partition: impl Into<PartitionId>, offset: Offset) -> Self {
        self.offsets.insert(partition.into(), offset);
        self
    }

    pub fn with_update(mut self, key: impl Into<Key>) -> Self {
        self.updates
            .insert(key.into(), Value::Object(serde_json::Map::new()));
        self
    }

    /// Keys affected by this change, in key order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.updates.keys()
    }

    pub fn is_supported_version(&self) -> bool {
        self.v == NOTIFICATION_SCHEMA_VERSION
    }
}

/// Body returned by the write proxy on a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub offset: Offset,
}

// ============================================================================
// TESTS
// ============================================================================
