//! Debounced update dispatch.
//!
//! Change notifications tend to arrive in bursts: one logical change to a key
//! can fan out into several notifications within a few milliseconds. The
//! dispatcher coalesces each burst into a single read of the key's current
//! value and a single call to every registered handler.
//!
//! Per key the state machine is `Idle -> Pending -> Idle`. The first
//! notification for an idle key arms a timer and moves it to `Pending`;
//! further notifications while pending are absorbed. When the timer fires the
//! key returns to `Idle` *before* the read starts, so a notification that
//! arrives during the read starts a fresh burst.

use crate::offsets::OffsetTracker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use kkv_core::{
    ChangeNotification, CounterMetric, Key, MetricSink, NotificationSource, Value, ValueFetcher,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Callback invoked with `(key, value)` once per settled burst.
pub type UpdateHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Registration handle returned by [`UpdateDispatcher::on_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

/// A key whose burst is still being coalesced.
#[derive(Debug, Clone, Copy)]
struct DebounceEntry {
    armed_at: Instant,
}

struct DispatcherInner {
    topic: String,
    window: Duration,
    fetcher: Arc<dyn ValueFetcher>,
    offsets: Arc<OffsetTracker>,
    metrics: Arc<dyn MetricSink>,
    handlers: DashMap<HandlerId, UpdateHandler>,
    next_handler: AtomicU64,
    pending: DashMap<Key, DebounceEntry>,
}

pub struct UpdateDispatcher {
    inner: Arc<DispatcherInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateDispatcher {
    pub fn new(
        topic: impl Into<String>,
        window: Duration,
        fetcher: Arc<dyn ValueFetcher>,
        offsets: Arc<OffsetTracker>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                topic: topic.into(),
                window,
                fetcher,
                offsets,
                metrics,
                handlers: DashMap::new(),
                next_handler: AtomicU64::new(0),
                pending: DashMap::new(),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Register a handler for settled updates.
    pub fn on_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.insert(id, Arc::new(handler));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(&id).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Subscribe to `source` and process its notifications in the background.
    ///
    /// The subscription is taken before this returns, so notifications
    /// published right after `start` are not missed. Returns `false` if the
    /// dispatcher was already started. Must be called inside a tokio runtime.
    pub fn start(&self, source: &dyn NotificationSource) -> bool {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return false;
        }

        let mut notifications = source.subscribe();
        let inner = Arc::clone(&self.inner);
        info!(topic = %inner.topic, window_ms = inner.window.as_millis() as u64, "Update dispatcher started");

        *listener = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                inner.handle_notification(&notification);
            }
            debug!(topic = %inner.topic, "Notification source closed");
        }));
        true
    }

    /// Unsubscribe from the notification source.
    ///
    /// Timers already armed still fire and dispatch.
    pub fn shutdown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!(topic = %self.inner.topic, "Update dispatcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Process one notification directly, bypassing the subscription.
    pub fn handle_notification(&self, notification: &ChangeNotification) {
        self.inner.handle_notification(notification);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// How long `key` has been waiting for its burst to settle.
    pub fn pending_for(&self, key: &str) -> Option<Duration> {
        self.inner
            .pending
            .get(key)
            .map(|entry| entry.armed_at.elapsed())
    }
}

impl Drop for UpdateDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl DispatcherInner {
    fn handle_notification(self: &Arc<Self>, notification: &ChangeNotification) {
        if notification.topic != self.topic {
            trace!(topic = %notification.topic, "Ignoring notification for other topic");
            return;
        }
        if !notification.is_supported_version() {
            warn!(
                topic = %notification.topic,
                version = notification.v,
                "Ignoring notification with unsupported schema version"
            );
            return;
        }

        self.offsets
            .update_partition_offset_metrics(&notification.offsets);

        for key in notification.keys() {
            self.schedule(key);
        }
    }

    fn schedule(self: &Arc<Self>, key: &Key) {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                trace!(key = %key, "Update absorbed into pending burst");
            }
            Entry::Vacant(slot) => {
                let inner = Arc::clone(self);
                let fire_key = key.clone();
                slot.insert(DebounceEntry {
                    armed_at: Instant::now(),
                });
                tokio::spawn(async move {
                    tokio::time::sleep(inner.window).await;
                    inner.fire(fire_key).await;
                });
                trace!(key = %key, "Debounce timer armed");
            }
        }
    }

    async fn fire(&self, key: Key) {
        self.pending.remove(&key);

        let mut handlers: Vec<(HandlerId, UpdateHandler)> = self
            .handlers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);

        match self.fetcher.fetch(&key).await {
            Ok(value) => {
                for (_, handler) in &handlers {
                    handler(&key, &value);
                }
                self.metrics
                    .inc(CounterMetric::UpdatesDispatched, &[&self.topic]);
                debug!(key = %key, handlers = handlers.len(), "Dispatched settled update");
            }
            Err(err) => {
                error!(key = %key, error = %err, "Failed to resolve updated value");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UpdateEvents;
    use kkv_core::GaugeMetric;
    use kkv_test_utils::{notification, RecordingMetrics, ScriptedFetcher, TEST_TOPIC};
    use serde_json::json;

    const KEY_A: &str = "bd3f6188-d865-443d-8646-03e8f1c643cb";
    const KEY_B: &str = "aaaa6188-d865-443d-8646-03e8f1c643cb";

    struct Fixture {
        dispatcher: UpdateDispatcher,
        fetcher: Arc<ScriptedFetcher>,
        metrics: Arc<RecordingMetrics>,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
    }

    fn fixture() -> Fixture {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let offsets = Arc::new(OffsetTracker::new("cache-kkv", TEST_TOPIC, metrics.clone()));
        let dispatcher = UpdateDispatcher::new(
            TEST_TOPIC,
            Duration::from_millis(10),
            fetcher.clone(),
            offsets,
            metrics.clone(),
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        dispatcher.on_update(move |key, value| {
            sink.lock().expect("calls").push((key.to_string(), value.clone()));
        });
        Fixture {
            dispatcher,
            fetcher,
            metrics,
            calls,
        }
    }

    fn calls(f: &Fixture) -> Vec<(String, Value)> {
        f.calls.lock().expect("calls").clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_notification_dispatches_once() {
        let f = fixture();
        f.fetcher.set_value(KEY_A, json!({ "foo": "bar" }));

        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 28262));
        assert!(f.dispatcher.is_pending(KEY_A));

        tokio::time::sleep(Duration::from_millis(11)).await;

        assert_eq!(calls(&f), vec![(KEY_A.to_string(), json!({ "foo": "bar" }))]);
        assert!(!f.dispatcher.is_pending(KEY_A));
        assert_eq!(
            f.metrics.gauge_sets(GaugeMetric::LastSeenOffset),
            vec![(
                vec!["cache-kkv".to_string(), TEST_TOPIC.to_string(), "0".to_string()],
                28262.0
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_per_key() {
        let f = fixture();
        f.fetcher.set_value(KEY_A, json!({ "foo": "bar" }));
        f.fetcher.set_value(KEY_B, json!({ "foo": "bar" }));

        for _ in 0..3 {
            f.dispatcher
                .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 28262));
        }
        for _ in 0..3 {
            f.dispatcher
                .handle_notification(&notification(TEST_TOPIC, KEY_B, "0", 28262));
        }
        assert_eq!(f.dispatcher.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls(&f).len(), 2);
        assert_eq!(f.fetcher.calls_for(KEY_A), 1);
        assert_eq!(f.fetcher.calls_for(KEY_B), 1);

        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 28265));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls(&f).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_is_read_at_resolution_time() {
        let f = fixture();
        f.fetcher.set_value(KEY_A, json!({ "rev": 1 }));
        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 1));

        tokio::time::sleep(Duration::from_millis(5)).await;
        f.fetcher.set_value(KEY_A, json!({ "rev": 2 }));
        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls(&f), vec![(KEY_A.to_string(), json!({ "rev": 2 }))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_topics_and_versions_are_ignored() {
        let f = fixture();
        f.dispatcher
            .handle_notification(&notification("othertopic", KEY_A, "0", 5));
        let mut future_version = notification(TEST_TOPIC, KEY_A, "0", 5);
        future_version.v = 2;
        f.dispatcher.handle_notification(&future_version);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(calls(&f).is_empty());
        assert!(f.metrics.gauge_sets(GaugeMetric::LastSeenOffset).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_skips_handlers_and_frees_key() {
        let f = fixture();
        f.fetcher.fail_key(KEY_A);
        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(calls(&f).is_empty());
        assert!(!f.dispatcher.is_pending(KEY_A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_registered_before_fire_is_invoked() {
        let f = fixture();
        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 1));

        let late = Arc::new(AtomicU64::new(0));
        let counter = late.clone();
        let id = f.dispatcher.on_update(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(late.load(Ordering::SeqCst), 1);

        assert!(f.dispatcher.remove_handler(id));
        assert!(!f.dispatcher.remove_handler(id));
        f.dispatcher
            .handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(late.load(Ordering::SeqCst), 1);
        assert_eq!(calls(&f).len(), 2);
    }

    /// Answers every key after a fixed delay.
    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ValueFetcher for SlowFetcher {
        async fn fetch(&self, _key: &str) -> kkv_core::KkvResult<Value> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({ "foo": "bar" }))
        }
    }

    fn counting_handler(dispatcher: &UpdateDispatcher) -> Arc<AtomicU64> {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        dispatcher.on_update(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_added_during_fetch_waits_for_next_burst() {
        let metrics = Arc::new(RecordingMetrics::new());
        let offsets = Arc::new(OffsetTracker::new("cache-kkv", TEST_TOPIC, metrics.clone()));
        let dispatcher = UpdateDispatcher::new(
            TEST_TOPIC,
            Duration::from_millis(10),
            Arc::new(SlowFetcher {
                delay: Duration::from_millis(50),
            }),
            offsets,
            metrics,
        );
        let early = counting_handler(&dispatcher);

        dispatcher.handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 1));
        // Timer fired at 10ms; the read runs until 60ms.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_pending(KEY_A));
        let late = counting_handler(&dispatcher);

        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.handle_notification(&notification(TEST_TOPIC, KEY_A, "0", 2));
        assert!(dispatcher.is_pending(KEY_A));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(early.load(Ordering::SeqCst), 2);
        assert_eq!(late.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_pending(KEY_A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown_lifecycle() {
        let f = fixture();
        let events = UpdateEvents::default();

        assert!(f.dispatcher.start(&events));
        assert!(!f.dispatcher.start(&events));
        assert!(f.dispatcher.is_running());
        assert_eq!(events.subscriber_count(), 1);

        events.emit(notification(TEST_TOPIC, KEY_A, "0", 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls(&f).len(), 1);

        f.dispatcher.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!f.dispatcher.is_running());
        assert_eq!(events.subscriber_count(), 0);

        events.emit(notification(TEST_TOPIC, KEY_A, "0", 2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls(&f).len(), 1);
    }
}
