//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; the delivery latency histogram is swapped to
//! zero on each report.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for delivery latency (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
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

/// Lock-free metrics collector shared by the fusion and delivery lanes
pub struct Metrics {
    readings_accepted: AtomicU64,
    /// Malformed or out-of-order inputs discarded by the fusion engine
    readings_dropped: AtomicU64,
    /// Inputs lost because the fusion channel was full
    inputs_dropped_channel_full: AtomicU64,
    detector_runs: AtomicU64,
    detector_failures: AtomicU64,
    windows_opened: AtomicU64,
    windows_expired: AtomicU64,
    events_confirmed: AtomicU64,
    events_enqueued: AtomicU64,
    store_write_failures: AtomicU64,
    /// Events evicted from the overflow buffer (data loss)
    overflow_evictions: AtomicU64,
    uploads_delivered: AtomicU64,
    upload_failures: AtomicU64,
    auth_retries: AtomicU64,
    dead_lettered: AtomicU64,
    worker_restarts: AtomicU64,
    pending_depth: AtomicU64,
    dead_letter_depth: AtomicU64,
    delivery_latency_buckets: [AtomicU64; NUM_BUCKETS],
    delivery_latency_sum_ms: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            readings_accepted: AtomicU64::new(0),
            readings_dropped: AtomicU64::new(0),
            inputs_dropped_channel_full: AtomicU64::new(0),
            detector_runs: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            windows_opened: AtomicU64::new(0),
            windows_expired: AtomicU64::new(0),
            events_confirmed: AtomicU64::new(0),
            events_enqueued: AtomicU64::new(0),
            store_write_failures: AtomicU64::new(0),
            overflow_evictions: AtomicU64::new(0),
            uploads_delivered: AtomicU64::new(0),
            upload_failures: AtomicU64::new(0),
            auth_retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            pending_depth: AtomicU64::new(0),
            dead_letter_depth: AtomicU64::new(0),
            delivery_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_latency_sum_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_reading_accepted(&self) {
        self.readings_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading_dropped(&self) {
        self.readings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_input_channel_full(&self) {
        self.inputs_dropped_channel_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detector_run(&self, failed: bool) {
        self.detector_runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.detector_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_window_opened(&self) {
        self.windows_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_window_expired(&self) {
        self.windows_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_confirmed(&self) {
        self.events_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_write_failure(&self) {
        self.store_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overflow_eviction(&self) {
        self.overflow_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered event with its claim-to-delivery latency
    #[inline]
    pub fn record_upload_delivered(&self, latency_ms: u64) {
        self.uploads_delivered.fetch_add(1, Ordering::Relaxed);
        self.delivery_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.delivery_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_failure(&self) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_retry(&self) {
        self.auth_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Update store depth gauges (sampled by the store after each mutation)
    #[inline]
    pub fn set_store_depths(&self, pending: usize, dead_letter: usize) {
        self.pending_depth.store(pending as u64, Ordering::Relaxed);
        self.dead_letter_depth.store(dead_letter as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_confirmed(&self) -> u64 {
        self.events_confirmed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn readings_dropped(&self) -> u64 {
        self.readings_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn uploads_delivered(&self) -> u64 {
        self.uploads_delivered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overflow_evictions(&self) -> u64 {
        self.overflow_evictions.load(Ordering::Relaxed)
    }

    /// Snapshot all counters; resets the latency histogram
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let latency_buckets = swap_buckets(&self.delivery_latency_buckets);
        let latency_sum = self.delivery_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_count: u64 = latency_buckets.iter().sum();

        MetricsSummary {
            elapsed_secs,
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            readings_dropped: self.readings_dropped.load(Ordering::Relaxed),
            inputs_dropped_channel_full: self.inputs_dropped_channel_full.load(Ordering::Relaxed),
            detector_runs: self.detector_runs.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            windows_opened: self.windows_opened.load(Ordering::Relaxed),
            windows_expired: self.windows_expired.load(Ordering::Relaxed),
            events_confirmed: self.events_confirmed.load(Ordering::Relaxed),
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            overflow_evictions: self.overflow_evictions.load(Ordering::Relaxed),
            uploads_delivered: self.uploads_delivered.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            pending_depth: self.pending_depth.load(Ordering::Relaxed),
            dead_letter_depth: self.dead_letter_depth.load(Ordering::Relaxed),
            delivery_latency_buckets: latency_buckets,
            delivery_latency_avg_ms: if latency_count > 0 { latency_sum / latency_count } else { 0 },
            delivery_latency_p95_ms: percentile_from_buckets(&latency_buckets, 0.95),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub elapsed_secs: f64,
    pub readings_accepted: u64,
    pub readings_dropped: u64,
    pub inputs_dropped_channel_full: u64,
    pub detector_runs: u64,
    pub detector_failures: u64,
    pub windows_opened: u64,
    pub windows_expired: u64,
    pub events_confirmed: u64,
    pub events_enqueued: u64,
    pub store_write_failures: u64,
    pub overflow_evictions: u64,
    pub uploads_delivered: u64,
    pub upload_failures: u64,
    pub auth_retries: u64,
    pub dead_lettered: u64,
    pub worker_restarts: u64,
    pub pending_depth: u64,
    pub dead_letter_depth: u64,
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600 ms
    pub delivery_latency_buckets: [u64; NUM_BUCKETS],
    pub delivery_latency_avg_ms: u64,
    pub delivery_latency_p95_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            readings_accepted = %self.readings_accepted,
            readings_dropped = %self.readings_dropped,
            inputs_dropped_channel_full = %self.inputs_dropped_channel_full,
            detector_runs = %self.detector_runs,
            detector_failures = %self.detector_failures,
            windows_opened = %self.windows_opened,
            windows_expired = %self.windows_expired,
            events_confirmed = %self.events_confirmed,
            events_enqueued = %self.events_enqueued,
            store_write_failures = %self.store_write_failures,
            overflow_evictions = %self.overflow_evictions,
            uploads_delivered = %self.uploads_delivered,
            upload_failures = %self.upload_failures,
            auth_retries = %self.auth_retries,
            dead_lettered = %self.dead_lettered,
            worker_restarts = %self.worker_restarts,
            pending = %self.pending_depth,
            dead_letter = %self.dead_letter_depth,
            delivery_avg_ms = %self.delivery_latency_avg_ms,
            delivery_p95_ms = %self.delivery_latency_p95_ms,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(51), 1);
        assert_eq!(bucket_index(25600), 9);
        assert_eq!(bucket_index(1_000_000), 10);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.95), 0);
    }

    #[test]
    fn test_report_resets_histogram_but_not_counters() {
        let metrics = Metrics::new();
        metrics.record_upload_delivered(120);
        metrics.record_upload_delivered(180);
        metrics.record_event_confirmed();

        let first = metrics.report();
        assert_eq!(first.uploads_delivered, 2);
        assert_eq!(first.delivery_latency_avg_ms, 150);
        assert_eq!(first.delivery_latency_buckets[2], 2);
        assert_eq!(first.events_confirmed, 1);

        let second = metrics.report();
        assert_eq!(second.uploads_delivered, 2);
        assert_eq!(second.delivery_latency_buckets.iter().sum::<u64>(), 0);
        assert_eq!(second.delivery_latency_avg_ms, 0);
    }

    #[test]
    fn test_detector_failures_count_as_runs() {
        let metrics = Metrics::new();
        metrics.record_detector_run(false);
        metrics.record_detector_run(true);
        let summary = metrics.report();
        assert_eq!(summary.detector_runs, 2);
        assert_eq!(summary.detector_failures, 1);
    }
}
