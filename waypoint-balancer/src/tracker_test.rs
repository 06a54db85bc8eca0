use std::sync::Arc;
use std::time::Duration;

use super::*;

fn tracker() -> Arc<CallTracker> {
    Arc::new(CallTracker::new(&CallTrackerConfig {
        bucket_count: 5,
        bucket_width_ms: 1000,
    }))
}

#[tokio::test(start_paused = true)]
async fn records_calls_and_errors() {
    let t = tracker();
    for _ in 0..8 {
        t.record(Duration::from_millis(10), Ok(()));
    }
    t.record(Duration::from_millis(30), Err(ErrorType::ServerError));
    t.record(Duration::from_millis(30), Err(ErrorType::Other));

    let stats = t.snapshot();
    assert_eq!(stats.call_count, 10);
    assert_eq!(stats.error_count, 2);
    assert!((stats.avg_latency_ms - 14.0).abs() < 1e-9);
    // Other does not count as degrading
    assert!((stats.error_rate(false) - 0.1).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn stream_errors_count_only_when_enabled() {
    let t = tracker();
    t.record(Duration::from_millis(5), Err(ErrorType::Stream));
    t.record(Duration::from_millis(5), Ok(()));

    let stats = t.snapshot();
    assert_eq!(stats.error_rate(false), 0.0);
    assert!((stats.error_rate(true) - 0.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn buckets_rotate_out_of_the_window() {
    let t = tracker();
    t.record(Duration::from_millis(5), Ok(()));
    tokio::time::advance(Duration::from_millis(2500)).await;
    t.record(Duration::from_millis(5), Ok(()));
    assert_eq!(t.snapshot().call_count, 2);

    tokio::time::advance(Duration::from_millis(3000)).await;
    // first call (slot 0) is out, second (slot 2) is still in
    assert_eq!(t.snapshot().call_count, 1);

    tokio::time::advance(Duration::from_millis(10_000)).await;
    let stats = t.snapshot();
    assert_eq!(stats.call_count, 0);
    assert_eq!(stats.total_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn outstanding_is_tracked_independently_of_rotation() {
    let t = tracker();
    let first = t.start_call();
    let second = t.start_call();
    assert_eq!(t.snapshot().outstanding, 2);

    tokio::time::advance(Duration::from_secs(8)).await;
    let stats = t.snapshot();
    assert_eq!(stats.outstanding, 2);
    assert!((stats.outstanding_avg_latency_ms - 8000.0).abs() < 1.0);

    first.finish(Ok(()));
    second.finish_with_latency(Err(ErrorType::Timeout), Duration::from_secs(8));
    let stats = t.snapshot();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.call_count, 2);
    assert_eq!(stats.outstanding_avg_latency_ms, 0.0);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_counts_as_other_error() {
    let t = tracker();
    {
        let _handle = t.start_call();
    }
    let stats = t.snapshot();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.errors.get(&ErrorType::Other), Some(&1));
    assert_eq!(stats.error_rate(true), 0.0);
}

#[tokio::test(start_paused = true)]
async fn blended_latency_includes_in_flight_calls() {
    let t = tracker();
    t.record(Duration::from_millis(100), Ok(()));
    let _hung = t.start_call();
    tokio::time::advance(Duration::from_millis(900)).await;

    let stats = t.snapshot();
    assert!((stats.blended_latency_ms() - 500.0).abs() < 1.0);
    assert!(stats.has_traffic());
}
