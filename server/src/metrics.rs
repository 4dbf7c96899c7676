use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 10;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct Latency {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Latency {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms: if count > 0 {
                total_ms as f64 / count as f64
            } else {
                0.0
            },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub requests: u64,
    pub server_errors: u64,
    pub reject_origin: u64,
    pub reject_body_limit: u64,
    pub reject_rate_limit: u64,
    pub latency: LatencySnapshot,
}

#[derive(Default)]
pub struct HttpMetrics {
    requests: AtomicU64,
    server_errors: AtomicU64,
    reject_origin: AtomicU64,
    reject_body_limit: AtomicU64,
    reject_rate_limit: AtomicU64,
    latency: Latency,
}

impl HttpMetrics {
    pub fn record(&self, status: u16, duration: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency.record(duration);
        match status {
            403 => self.reject_origin.fetch_add(1, Ordering::Relaxed),
            413 => self.reject_body_limit.fetch_add(1, Ordering::Relaxed),
            429 => self.reject_rate_limit.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.server_errors.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LifecycleMetricsSnapshot {
    pub raffles_created: u64,
    pub raffles_activated: u64,
    pub raffles_completed: u64,
    pub chain_failures: u64,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub event_failures: u64,
}

/// Counters for the scheduler and the reconciler.
#[derive(Default)]
pub struct LifecycleMetrics {
    raffles_created: AtomicU64,
    raffles_activated: AtomicU64,
    raffles_completed: AtomicU64,
    chain_failures: AtomicU64,
    events_applied: AtomicU64,
    events_skipped: AtomicU64,
    event_failures: AtomicU64,
}

impl LifecycleMetrics {
    pub fn inc_created(&self) {
        self.raffles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_activated(&self) {
        self.raffles_activated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completed(&self) {
        self.raffles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chain_failure(&self) {
        self.chain_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_event_failure(&self) {
        self.event_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LifecycleMetricsSnapshot {
        LifecycleMetricsSnapshot {
            raffles_created: self.raffles_created.load(Ordering::Relaxed),
            raffles_activated: self.raffles_activated.load(Ordering::Relaxed),
            raffles_completed: self.raffles_completed.load(Ordering::Relaxed),
            chain_failures: self.chain_failures.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            event_failures: self.event_failures.load(Ordering::Relaxed),
        }
    }
}
