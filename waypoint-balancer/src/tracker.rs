use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CallTrackerConfig;

/// Failure classification reported by the transport when a call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The connection could not be established
    Connect,
    /// The channel was closed while the call was in flight
    ClosedChannel,
    /// The remote answered with a server side failure
    ServerError,
    Timeout,
    /// Streaming body failed mid-way
    Stream,
    /// Anything else, including calls abandoned without a result
    Other,
}

impl ErrorType {
    /// Whether the error says something about the health of the endpoint.
    pub fn is_degrading(&self, count_stream_errors: bool) -> bool {
        match self {
            ErrorType::Connect
            | ErrorType::ClosedChannel
            | ErrorType::ServerError
            | ErrorType::Timeout => true,
            ErrorType::Stream => count_stream_errors,
            ErrorType::Other => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    slot: u64,
    calls: u64,
    latency_sum_ms: f64,
    errors: BTreeMap<ErrorType, u64>,
}

#[derive(Debug)]
struct Window {
    buckets: Vec<Bucket>,
    outstanding: u64,
    // sum of the start offsets (ms since epoch) of the in-flight calls
    outstanding_start_sum_ms: f64,
}

/// Snapshot of an endpoint's recent traffic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStats {
    /// Completed calls in the window
    pub call_count: u64,
    /// Completed calls that failed, of any type
    pub error_count: u64,
    pub errors: BTreeMap<ErrorType, u64>,
    /// Average latency of the completed calls (milliseconds)
    pub avg_latency_ms: f64,
    /// Calls started and not finished yet
    pub outstanding: u64,
    /// Average age of the in-flight calls (milliseconds)
    pub outstanding_avg_latency_ms: f64,
    /// Completed calls since the tracker was created
    pub total_calls: u64,
}

impl CallStats {
    /// Share of completed calls that failed with a degrading error type.
    pub fn error_rate(&self, count_stream_errors: bool) -> f64 {
        if self.call_count == 0 {
            return 0.0;
        }
        let degrading: u64 = self
            .errors
            .iter()
            .filter(|(t, _)| t.is_degrading(count_stream_errors))
            .map(|(_, n)| *n)
            .sum();
        degrading as f64 / self.call_count as f64
    }

    /// Latency blending completed and in-flight calls, weighted by their counts.
    pub fn blended_latency_ms(&self) -> f64 {
        let total = self.call_count + self.outstanding;
        if total == 0 {
            return 0.0;
        }
        (self.avg_latency_ms * self.call_count as f64
            + self.outstanding_avg_latency_ms * self.outstanding as f64)
            / total as f64
    }

    pub fn has_traffic(&self) -> bool {
        self.call_count > 0 || self.outstanding > 0
    }
}

/// Rolling call statistics of one endpoint.
///
/// Calls land in fixed-width time buckets; a bucket whose slot fell out of the
/// window is reset the next time it is touched, so no timer is involved. The
/// outstanding counter lives outside the buckets and is never rotated.
#[derive(Debug)]
pub struct CallTracker {
    epoch: Instant,
    bucket_width: Duration,
    window: Mutex<Window>,
    completed: AtomicU64,
}

impl CallTracker {
    pub fn new(config: &CallTrackerConfig) -> Self {
        let count = config.bucket_count.max(1);
        CallTracker {
            epoch: Instant::now(),
            bucket_width: config.bucket_width().max(Duration::from_millis(1)),
            window: Mutex::new(Window {
                buckets: vec![Bucket::default(); count],
                outstanding: 0,
                outstanding_start_sum_ms: 0.0,
            }),
            completed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        // a panic while holding the lock cannot leave the counters half written
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.epoch).as_millis() / self.bucket_width.as_millis())
            as u64
    }

    fn offset_ms(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.epoch).as_secs_f64() * 1000.0
    }

    /// Marks the start of a call. The returned handle must be finished, dropping it
    /// records the call as failed with `ErrorType::Other`.
    pub fn start_call(self: &Arc<Self>) -> CallHandle {
        let started = Instant::now();
        {
            let mut window = self.lock();
            window.outstanding += 1;
            window.outstanding_start_sum_ms += self.offset_ms(started);
        }
        CallHandle {
            tracker: Arc::clone(self),
            started,
            finished: false,
        }
    }

    /// Records an already completed call (used by synthetic traffic and tests).
    pub fn record(&self, latency: Duration, outcome: Result<(), ErrorType>) {
        let now = Instant::now();
        let mut window = self.lock();
        self.add_completed(&mut window, now, latency, outcome);
    }

    fn end_call(&self, started: Instant, latency: Duration, outcome: Result<(), ErrorType>) {
        let now = Instant::now();
        let mut window = self.lock();
        window.outstanding = window.outstanding.saturating_sub(1);
        window.outstanding_start_sum_ms =
            (window.outstanding_start_sum_ms - self.offset_ms(started)).max(0.0);
        if window.outstanding == 0 {
            window.outstanding_start_sum_ms = 0.0;
        }
        self.add_completed(&mut window, now, latency, outcome);
    }

    fn add_completed(
        &self,
        window: &mut Window,
        now: Instant,
        latency: Duration,
        outcome: Result<(), ErrorType>,
    ) {
        let slot = self.slot(now);
        let len = window.buckets.len() as u64;
        let bucket = &mut window.buckets[(slot % len) as usize];
        if bucket.slot != slot || bucket.calls == 0 {
            *bucket = Bucket {
                slot,
                ..Bucket::default()
            };
        }
        bucket.calls += 1;
        bucket.latency_sum_ms += latency.as_secs_f64() * 1000.0;
        if let Err(error_type) = outcome {
            *bucket.errors.entry(error_type).or_default() += 1;
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed calls since the tracker was created, without touching the window.
    pub fn total_calls(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Statistics over the buckets still inside the window.
    pub fn snapshot(&self) -> CallStats {
        let now = Instant::now();
        let current = self.slot(now);
        let window = self.lock();
        let len = window.buckets.len() as u64;

        let mut stats = CallStats {
            outstanding: window.outstanding,
            total_calls: self.total_calls(),
            ..CallStats::default()
        };
        let mut latency_sum = 0.0;
        for bucket in &window.buckets {
            if bucket.calls == 0 || bucket.slot > current || current - bucket.slot >= len {
                continue;
            }
            stats.call_count += bucket.calls;
            latency_sum += bucket.latency_sum_ms;
            for (error_type, n) in &bucket.errors {
                *stats.errors.entry(*error_type).or_default() += n;
                stats.error_count += n;
            }
        }
        if stats.call_count > 0 {
            stats.avg_latency_ms = latency_sum / stats.call_count as f64;
        }
        if window.outstanding > 0 {
            let avg_start = window.outstanding_start_sum_ms / window.outstanding as f64;
            stats.outstanding_avg_latency_ms = (self.offset_ms(now) - avg_start).max(0.0);
        }
        stats
    }
}

/// In-flight call. Finishing it feeds the result back to the endpoint's tracker.
#[derive(Debug)]
pub struct CallHandle {
    tracker: Arc<CallTracker>,
    started: Instant,
    finished: bool,
}

impl CallHandle {
    /// Finishes the call with the latency measured since `start_call`.
    pub fn finish(self, outcome: Result<(), ErrorType>) {
        let latency = self.started.elapsed();
        self.finish_with_latency(outcome, latency);
    }

    pub fn finish_with_latency(mut self, outcome: Result<(), ErrorType>, latency: Duration) {
        self.finished = true;
        self.tracker.end_call(self.started, latency, outcome);
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker
                .end_call(self.started, self.started.elapsed(), Err(ErrorType::Other));
        }
    }
}

/// A routable endpoint: identity, partition weights and call statistics.
#[derive(Debug)]
pub struct TrackerClient {
    uri: String,
    scheme: String,
    cluster: String,
    partitions: BTreeMap<u32, f64>,
    do_not_slow_start: bool,
    tracker: Arc<CallTracker>,
}

impl TrackerClient {
    pub fn new(
        uri: impl Into<String>,
        scheme: impl Into<String>,
        cluster: impl Into<String>,
        partitions: BTreeMap<u32, f64>,
        do_not_slow_start: bool,
        tracker: Arc<CallTracker>,
    ) -> Self {
        TrackerClient {
            uri: uri.into(),
            scheme: scheme.into(),
            cluster: cluster.into(),
            partitions,
            do_not_slow_start,
            tracker,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn partitions(&self) -> &BTreeMap<u32, f64> {
        &self.partitions
    }

    /// Announced weight in a partition, `None` when not a member of it.
    pub fn weight(&self, partition_id: u32) -> Option<f64> {
        self.partitions.get(&partition_id).copied()
    }

    pub fn do_not_slow_start(&self) -> bool {
        self.do_not_slow_start
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    pub fn start_call(&self) -> CallHandle {
        self.tracker.start_call()
    }

    pub fn snapshot(&self) -> CallStats {
        self.tracker.snapshot()
    }
}

#[cfg(test)]
#[path = "tracker_test.rs"]
mod tracker_test;
