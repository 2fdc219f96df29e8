//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the ingest path, the poller and
//! the dispatcher. Reporting swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Cooldown and evaluation decisions live in the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Send latency bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    samples_ingested: AtomicU64,
    samples_invalid: AtomicU64,
    stale_samples: AtomicU64,
    transitions_detected: AtomicU64,
    cooldown_suppressed: AtomicU64,
    dispatches: AtomicU64,
    manual_dispatches: AtomicU64,
    recipients_sent: AtomicU64,
    recipients_failed: AtomicU64,
    confirmations_sent: AtomicU64,
    persistence_failures: AtomicU64,
    poller_ticks: AtomicU64,
    /// Dispatches since last report (reset on report)
    dispatches_since_report: AtomicU64,
    /// Per-recipient send latency histogram (cumulative, for Prometheus)
    send_latency_buckets: [AtomicU64; NUM_BUCKETS],
    send_latency_sum_ms: AtomicU64,
    /// Max send latency since last report (reset on report)
    send_latency_max_ms: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_ingested: AtomicU64::new(0),
            samples_invalid: AtomicU64::new(0),
            stale_samples: AtomicU64::new(0),
            transitions_detected: AtomicU64::new(0),
            cooldown_suppressed: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            manual_dispatches: AtomicU64::new(0),
            recipients_sent: AtomicU64::new(0),
            recipients_failed: AtomicU64::new(0),
            confirmations_sent: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            poller_ticks: AtomicU64::new(0),
            dispatches_since_report: AtomicU64::new(0),
            send_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            send_latency_sum_ms: AtomicU64::new(0),
            send_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample(&self) {
        self.samples_ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_sample(&self) {
        self.samples_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_sample(&self) {
        self.stale_samples.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self) {
        self.transitions_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cooldown_suppressed(&self) {
        self.cooldown_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch(&self, manual: bool) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.dispatches_since_report.fetch_add(1, Ordering::Relaxed);
        if manual {
            self.manual_dispatches.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one recipient delivery attempt and how long it took
    #[inline]
    pub fn record_delivery(&self, sent: bool, latency_ms: u64) {
        if sent {
            self.recipients_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recipients_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.send_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.send_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.send_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_confirmation(&self) {
        self.confirmations_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_poller_tick(&self) {
        self.poller_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn samples_ingested(&self) -> u64 {
        self.samples_ingested.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn cooldown_suppressed(&self) -> u64 {
        self.cooldown_suppressed.load(Ordering::Relaxed)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self, tracked_subjects: usize) -> MetricsSummary {
        self.summarize(tracked_subjects, true)
    }

    /// Same as `report` but leaves periodic counters alone (used by scrapes)
    pub fn snapshot(&self, tracked_subjects: usize) -> MetricsSummary {
        self.summarize(tracked_subjects, false)
    }

    fn summarize(&self, tracked_subjects: usize, reset: bool) -> MetricsSummary {
        let (dispatches_period, send_latency_max_ms, elapsed) = if reset {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            (
                self.dispatches_since_report.swap(0, Ordering::Relaxed),
                self.send_latency_max_ms.swap(0, Ordering::Relaxed),
                elapsed,
            )
        } else {
            (
                self.dispatches_since_report.load(Ordering::Relaxed),
                self.send_latency_max_ms.load(Ordering::Relaxed),
                self.last_report_time.lock().elapsed(),
            )
        };

        let dispatches_per_min = if elapsed.as_secs_f64() > 0.0 {
            dispatches_period as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let send_latency_buckets = load_buckets(&self.send_latency_buckets);
        let send_count: u64 = send_latency_buckets.iter().sum();
        let send_latency_sum_ms = self.send_latency_sum_ms.load(Ordering::Relaxed);
        let send_latency_avg_ms =
            if send_count > 0 { send_latency_sum_ms / send_count } else { 0 };

        MetricsSummary {
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            samples_invalid: self.samples_invalid.load(Ordering::Relaxed),
            stale_samples: self.stale_samples.load(Ordering::Relaxed),
            transitions_detected: self.transitions_detected.load(Ordering::Relaxed),
            cooldown_suppressed: self.cooldown_suppressed.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            manual_dispatches: self.manual_dispatches.load(Ordering::Relaxed),
            recipients_sent: self.recipients_sent.load(Ordering::Relaxed),
            recipients_failed: self.recipients_failed.load(Ordering::Relaxed),
            confirmations_sent: self.confirmations_sent.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            poller_ticks: self.poller_ticks.load(Ordering::Relaxed),
            dispatches_per_min,
            send_latency_buckets,
            send_latency_sum_ms,
            send_latency_avg_ms,
            send_latency_max_ms,
            send_latency_p99_ms: percentile_from_buckets(&send_latency_buckets, 0.99),
            tracked_subjects,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_ingested: u64,
    pub samples_invalid: u64,
    pub stale_samples: u64,
    pub transitions_detected: u64,
    pub cooldown_suppressed: u64,
    pub dispatches: u64,
    pub manual_dispatches: u64,
    pub recipients_sent: u64,
    pub recipients_failed: u64,
    pub confirmations_sent: u64,
    pub persistence_failures: u64,
    pub poller_ticks: u64,
    pub dispatches_per_min: f64,
    /// Cumulative send latency histogram (ms)
    pub send_latency_buckets: [u64; NUM_BUCKETS],
    pub send_latency_sum_ms: u64,
    pub send_latency_avg_ms: u64,
    pub send_latency_max_ms: u64,
    pub send_latency_p99_ms: u64,
    pub tracked_subjects: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples = %self.samples_ingested,
            invalid = %self.samples_invalid,
            transitions = %self.transitions_detected,
            suppressed = %self.cooldown_suppressed,
            dispatches = %self.dispatches,
            dispatches_per_min = format!("{:.1}", self.dispatches_per_min),
            sent = %self.recipients_sent,
            failed = %self.recipients_failed,
            send_avg_ms = %self.send_latency_avg_ms,
            send_p99_ms = %self.send_latency_p99_ms,
            persistence_failures = %self.persistence_failures,
            tracked = %self.tracked_subjects,
            "metrics"
        );
    }
}
