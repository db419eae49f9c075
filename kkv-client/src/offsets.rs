//! Monotonic last-seen-offset tracking.
//!
//! Offsets reach the tracker from three places: change notifications (which
//! may arrive late because of debouncing), point-read response headers and
//! bulk-stream response headers. Only strictly increasing values per
//! partition are recorded and published, so the gauge can never move
//! backwards no matter which path reports first.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kkv_core::{GaugeMetric, MetricSink, Offset, PartitionId, PartitionOffset};
use std::sync::Arc;
use tracing::trace;

pub struct OffsetTracker {
    cache_host: String,
    topic: String,
    last_seen: DashMap<PartitionId, Offset>,
    metrics: Arc<dyn MetricSink>,
}

impl OffsetTracker {
    pub fn new(
        cache_host: impl Into<String>,
        topic: impl Into<String>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            cache_host: cache_host.into(),
            topic: topic.into(),
            last_seen: DashMap::new(),
            metrics,
        }
    }

    /// Record and publish every candidate that beats the stored offset.
    ///
    /// Returns how many partitions were published.
    pub fn update_partition_offset_metrics<'a, I>(&self, offsets: I) -> usize
    where
        I: IntoIterator<Item = (&'a PartitionId, &'a Offset)>,
    {
        offsets
            .into_iter()
            .filter(|(partition, offset)| self.observe(partition, **offset))
            .count()
    }

    /// Compare-and-publish for a single partition.
    pub fn observe(&self, partition: &str, offset: Offset) -> bool {
        let guard = match self.last_seen.entry(partition.to_string()) {
            Entry::Occupied(mut entry) => {
                if offset <= *entry.get() {
                    trace!(
                        partition = partition,
                        offset = offset,
                        last_seen = *entry.get(),
                        "Ignoring stale offset"
                    );
                    return false;
                }
                entry.insert(offset);
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(offset),
        };

        // Publish before releasing the shard so racing callers publish in order.
        self.metrics.set(
            GaugeMetric::LastSeenOffset,
            &[self.cache_host.as_str(), self.topic.as_str(), partition],
            offset as f64,
        );
        drop(guard);
        true
    }

    pub fn last_seen(&self, partition: &str) -> Option<Offset> {
        self.last_seen.get(partition).map(|entry| *entry.value())
    }

    /// Current offsets, sorted by partition.
    pub fn snapshot(&self) -> Vec<PartitionOffset> {
        let mut offsets: Vec<PartitionOffset> = self
            .last_seen
            .iter()
            .map(|entry| PartitionOffset::new(entry.key().clone(), *entry.value()))
            .collect();
        offsets.sort_by(|a, b| a.partition.cmp(&b.partition));
        offsets
    }
}

impl std::fmt::Debug for OffsetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetTracker")
            .field("cache_host", &self.cache_host)
            .field("topic", &self.topic)
            .field("partitions", &self.last_seen.len())
            .finish()
    }
}
