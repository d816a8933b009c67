//! Queue admission, ordering and the global concurrency cap

#![allow(clippy::expect_used)]

mod common;

use common::{MockTransport, client, config, settle, with_remaining};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tollgate_client::{ClientConfig, FetchError, FetchOptions, GLOBAL_CONCURRENCY_CAP};

fn bounded(limit: u32, max_queue_length: usize) -> ClientConfig {
    ClientConfig {
        max_queue_length,
        ..config(limit)
    }
}

#[tokio::test(start_paused = true)]
async fn end_to_end_admission_scenario() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
    let client = client(bounded(1, 1), &transport);

    let f1 = client.fetch("/f1", FetchOptions::new());
    let snapshot = client.snapshot();
    assert_eq!(snapshot.total_ongoing, 1);
    assert_eq!(snapshot.channels[0].ongoing, 1);

    let f2 = client.fetch("/f2", FetchOptions::new());
    assert_eq!(client.snapshot().total_queued, 1);

    let err = client
        .fetch("/f3", FetchOptions::new())
        .await
        .expect_err("queue is full");
    assert_eq!(err, FetchError::CapacityExceeded { max_queue_length: 1 });
    assert!(err.is_admission_error());

    f1.await.expect("f1");
    let f1_done = Instant::now();
    f2.await.expect("f2");

    assert_eq!(transport.paths(), vec!["/f1".to_string(), "/f2".to_string()]);
    assert!(transport.calls()[1].at >= f1_done);
    let snapshot = client.snapshot();
    assert_eq!(snapshot.total_ongoing, 0);
    assert_eq!(snapshot.total_queued, 0);
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_without_transport_call() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(5)));
    let client = client(bounded(1, 2), &transport);

    let running = client.fetch("/running", FetchOptions::new());
    let a = client.fetch("/a", FetchOptions::new());
    let b = client.fetch("/b", FetchOptions::new());
    assert_eq!(client.snapshot().total_queued, 2);

    let rejected = client.fetch("/c", FetchOptions::new());
    settle().await;
    assert_eq!(transport.call_count(), 1);
    assert!(matches!(
        rejected.await,
        Err(FetchError::CapacityExceeded { max_queue_length: 2 })
    ));

    let results = join_all([running, a, b]).await;
    assert!(results.iter().all(Result::is_ok));
    assert!(!transport.paths().contains(&"/c".to_string()));
}

#[tokio::test(start_paused = true)]
async fn priority_request_dispatches_before_earlier_normal_request() {
    let transport = Arc::new(MockTransport::new().with_default(with_remaining(0)));
    let client = client(config(1), &transport);

    client
        .fetch("/warmup", FetchOptions::new())
        .await
        .expect("warmup");
    assert_eq!(client.snapshot().channels[0].remaining, 0);

    let normal = client.fetch("/a", FetchOptions::new());
    let priority = client.fetch("/b", FetchOptions::new().priority(true));
    let snapshot = client.snapshot();
    assert_eq!(snapshot.channels[0].queued_count, 2);
    assert_eq!(snapshot.channels[0].priority_queued_count, 1);

    let (normal, priority) = tokio::join!(normal, priority);
    normal.expect("normal");
    priority.expect("priority");

    assert_eq!(
        transport.paths(),
        vec!["/warmup".to_string(), "/b".to_string(), "/a".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn escalation_moves_queued_request_to_priority_tail() {
    let transport = Arc::new(MockTransport::new().with_default(with_remaining(0)));
    let client = client(config(1), &transport);

    client
        .fetch("/warmup", FetchOptions::new())
        .await
        .expect("warmup");

    let other = client.fetch("/other", FetchOptions::new());
    let original = client.fetch("/target", FetchOptions::new().allow_stacking(false));
    assert_eq!(client.snapshot().channels[0].priority_queued_count, 0);

    let escalated = client.fetch(
        "/target",
        FetchOptions::new().priority(true).allow_stacking(true),
    );
    let snapshot = client.snapshot();
    assert_eq!(snapshot.channels[0].queued_count, 2);
    assert_eq!(snapshot.channels[0].priority_queued_count, 1);
    assert_eq!(snapshot.total_queued, 2);

    let (other, original, escalated) = tokio::join!(other, original, escalated);
    other.expect("other");
    let original = original.expect("original");
    let escalated = escalated.expect("escalated");

    assert!(Arc::ptr_eq(&original, &escalated));
    assert_eq!(
        transport.paths(),
        vec![
            "/warmup".to_string(),
            "/target".to_string(),
            "/other".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stacking_disabled_queues_a_second_request() {
    let transport = Arc::new(MockTransport::new().with_default(with_remaining(0)));
    let client = client(config(1), &transport);

    client
        .fetch("/warmup", FetchOptions::new())
        .await
        .expect("warmup");

    let first = client.fetch("/same", FetchOptions::new());
    let second = client.fetch("/same", FetchOptions::new().allow_stacking(false));
    assert_eq!(client.snapshot().total_queued, 2);

    let (first, second) = tokio::join!(first, second);
    first.expect("first");
    second.expect("second");
}

#[tokio::test(start_paused = true)]
async fn queued_requests_wait_for_quota_reset() {
    let transport = Arc::new(MockTransport::new().with_default(with_remaining(0)));
    let client = client(config(1), &transport);
    let start = Instant::now();

    client
        .fetch("/first", FetchOptions::new())
        .await
        .expect("first");
    client
        .fetch("/second", FetchOptions::new())
        .await
        .expect("second");

    let calls = transport.calls();
    let waited = calls[1].at.duration_since(start);
    // 60s interval plus 1s grace
    assert!(waited > Duration::from_secs(61));
    assert!(waited < Duration::from_secs(62));
}

#[tokio::test(start_paused = true)]
async fn global_cap_limits_concurrent_dispatches() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_secs(1)));
    let client = client(bounded(1000, 100), &transport);

    let pending: Vec<_> = (0..60)
        .map(|i| client.fetch(format!("/item/{i}"), FetchOptions::new()))
        .collect();

    let snapshot = client.snapshot();
    assert_eq!(snapshot.total_ongoing, GLOBAL_CONCURRENCY_CAP + 1);
    assert_eq!(snapshot.total_queued, 60 - (GLOBAL_CONCURRENCY_CAP + 1));

    let results = join_all(pending).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.call_count(), 60);
    assert_eq!(client.snapshot().total_ongoing, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_caller_does_not_cancel_queued_request() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(10)));
    let client = client(config(1), &transport);

    let running = client.fetch("/running", FetchOptions::new());
    drop(client.fetch("/abandoned", FetchOptions::new()));

    running.await.expect("running");
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(
        transport.paths(),
        vec!["/running".to_string(), "/abandoned".to_string()]
    );
    assert_eq!(client.snapshot().total_queued, 0);
}
