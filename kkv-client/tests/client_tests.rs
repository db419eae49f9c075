//! End-to-end scenarios through [`KkvClient`] with a scripted transport.

use kkv_client::{KkvClient, UpdateEvents};
use kkv_core::{
    CounterMetric, GaugeMetric, KkvError, PutOptions, TransportResponse, Value,
    LAST_SEEN_OFFSETS_HEADER,
};
use kkv_test_utils::{
    chunked_stream, fed_stream, notification, test_config, write_failed, write_ok, MockTransport,
    RecordingMetrics, TEST_TOPIC,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEY_A: &str = "bd3f6188-d865-443d-8646-03e8f1c643cb";
const KEY_B: &str = "aaaa6188-d865-443d-8646-03e8f1c643cb";

struct Harness {
    client: KkvClient,
    transport: Arc<MockTransport>,
    metrics: Arc<RecordingMetrics>,
}

fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let client = KkvClient::new(test_config(), transport.clone(), metrics.clone())
        .expect("test config is valid");
    Harness {
        client,
        transport,
        metrics,
    }
}

fn offset_gauge(metrics: &RecordingMetrics) -> Vec<(String, f64)> {
    metrics
        .gauge_sets(GaugeMetric::LastSeenOffset)
        .into_iter()
        .map(|(labels, value)| {
            assert_eq!(labels[0], "cache-kkv");
            assert_eq!(labels[1], TEST_TOPIC);
            (labels[2].clone(), value)
        })
        .collect()
}

// ============================================================================
// PUT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_put_succeeds_after_one_failure() {
    let h = harness();
    h.transport.push_write(write_failed(503)).push_write(write_ok(3));

    let offset = h
        .client
        .put("key1", "value1", None)
        .await
        .expect("second attempt succeeds");

    assert_eq!(offset, 3);
    assert_eq!(h.transport.write_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_put_gives_up_after_retry_budget() {
    let h = harness();
    h.transport.always_write(write_failed(503));

    let err = h
        .client
        .put("key1", "value1", Some(PutOptions::new(100, 10)))
        .await
        .unwrap_err();

    assert!(matches!(err, KkvError::RetryExhausted { attempts: 11, .. }));
    assert_eq!(h.transport.write_calls(), 11);
}

#[tokio::test]
async fn test_put_with_gzip_config() {
    let transport = Arc::new(MockTransport::new());
    transport.push_write(write_ok(1));
    let client = KkvClient::new(
        test_config().with_gzip_payloads(true),
        transport.clone(),
        Arc::new(RecordingMetrics::new()),
    )
    .expect("valid config");

    client.put("k", &json!({ "foo": "bar" }), None).await.expect("write");
    let request = &transport.write_requests()[0];
    assert!(request.gzip);
    assert_eq!(
        kkv_client::decompress_gzip_response(&request.body).expect("gzip"),
        json!({ "foo": "bar" })
    );
}

// ============================================================================
// STREAM
// ============================================================================

#[tokio::test]
async fn test_empty_stream_yields_no_records() {
    let h = harness();
    h.transport
        .push_stream(chunked_stream(200, Vec::<&'static str>::new()));

    let mut records = Vec::new();
    let summary = h
        .client
        .stream_values(|v| records.push(v))
        .await
        .expect("stream");

    assert!(records.is_empty());
    assert_eq!(summary.records, 0);
}

#[tokio::test]
async fn test_stream_record_split_across_chunks() {
    let h = harness();
    h.transport.push_stream(chunked_stream(
        200,
        ["{\"foo\":\"bar\"}\n", "{\"foo\":\"bar2\"", "}\n"],
    ));

    let mut records = Vec::new();
    h.client
        .stream_values(|v| records.push(v))
        .await
        .expect("stream");

    assert_eq!(records, vec![json!({ "foo": "bar" }), json!({ "foo": "bar2" })]);
    assert_eq!(
        h.metrics.counter_total(CounterMetric::StreamRecords, &[TEST_TOPIC]),
        2
    );
}

#[tokio::test]
async fn test_stream_header_offsets_applied_after_stream_ends() {
    let h = harness();
    let (mut feeder, response) = fed_stream(200);
    h.transport.push_stream(response.with_header(
        LAST_SEEN_OFFSETS_HEADER,
        r#"[{"topic":"testtopic01","partition":0,"offset":17}]"#,
    ));

    let records = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = records.clone();
    let client = &h.client;
    let consume = client.stream_values(move |v| sink.lock().expect("records").push(v));
    tokio::pin!(consume);

    feeder.send("{\"foo\":\"bar\"}\n");
    tokio::select! {
        _ = &mut consume => panic!("stream ended before the source finished"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
    }
    assert_eq!(records.lock().expect("records").len(), 1);
    assert!(offset_gauge(&h.metrics).is_empty());

    feeder.finish();
    let summary = consume.await.expect("stream");
    assert_eq!(summary.records, 1);
    assert_eq!(offset_gauge(&h.metrics), vec![("0".to_string(), 17.0)]);
}

#[tokio::test]
async fn test_stream_transport_error_propagates() {
    let h = harness();
    let err = h.client.stream_values(|_| {}).await.unwrap_err();
    assert!(matches!(err, KkvError::Transport { operation: "stream", .. }));
}

// ============================================================================
// OFFSETS
// ============================================================================

#[test]
fn test_only_increasing_offsets_are_published() {
    let h = harness();
    let map = |pairs: &[(&str, i64)]| -> HashMap<String, i64> {
        pairs.iter().map(|(p, o)| (p.to_string(), *o)).collect()
    };

    h.client
        .update_partition_offset_metrics(&map(&[("p1", 1), ("p2", 2)]));
    h.client
        .update_partition_offset_metrics(&map(&[("p1", 1), ("p2", 1)]));
    h.client.update_partition_offset_metrics(&map(&[("p2", 3)]));

    let mut published: Vec<f64> = offset_gauge(&h.metrics).into_iter().map(|(_, v)| v).collect();
    assert_eq!(published.len(), 3);
    published.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
    assert_eq!(published, vec![1.0, 2.0, 3.0]);
}

// ============================================================================
// UPDATES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_bursts_are_debounced() {
    let h = harness();
    for key in [KEY_A, KEY_B] {
        h.transport
            .always_read(key, TransportResponse::new(200, r#"{"foo":"bar"}"#));
    }
    let events = UpdateEvents::default();
    assert!(h.client.start(&events));

    let calls = Arc::new(Mutex::new(Vec::<(String, Value)>::new()));
    let sink = calls.clone();
    h.client.on_update(move |key, value| {
        sink.lock().expect("calls").push((key.to_string(), value.clone()));
    });

    for _ in 0..3 {
        events.emit(notification(TEST_TOPIC, KEY_A, "0", 28262));
    }
    for _ in 0..3 {
        events.emit(notification(TEST_TOPIC, KEY_B, "0", 28262));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    {
        let calls = calls.lock().expect("calls");
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, v)| *v == json!({ "foo": "bar" })));
    }
    assert_eq!(h.transport.read_calls(), 2);
    assert_eq!(offset_gauge(&h.metrics), vec![("0".to_string(), 28262.0)]);

    events.emit(notification(TEST_TOPIC, KEY_A, "0", 28263));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.lock().expect("calls").len(), 3);

    h.client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_failed_resolution_read_skips_handlers() {
    let h = harness();
    let events = UpdateEvents::default();
    h.client.start(&events);

    let calls = Arc::new(Mutex::new(0usize));
    let sink = calls.clone();
    h.client.on_update(move |_, _| *sink.lock().expect("calls") += 1);

    // No scripted read, so the cache answers 404.
    events.emit(notification(TEST_TOPIC, KEY_A, "0", 1));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(*calls.lock().expect("calls"), 0);
    assert_eq!(h.transport.read_calls(), 1);
    assert!(!h.client.dispatcher().is_pending(KEY_A));
}

#[tokio::test(start_paused = true)]
async fn test_pending_timer_fires_after_shutdown() {
    let h = harness();
    h.transport
        .always_read(KEY_A, TransportResponse::new(200, "1"));
    let events = UpdateEvents::default();
    h.client.start(&events);

    let calls = Arc::new(Mutex::new(0usize));
    let sink = calls.clone();
    h.client.on_update(move |_, _| *sink.lock().expect("calls") += 1);

    events.emit(notification(TEST_TOPIC, KEY_A, "0", 1));
    tokio::time::sleep(Duration::from_millis(2)).await;
    h.client.shutdown();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*calls.lock().expect("calls"), 1);
}
