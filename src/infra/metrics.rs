//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain relaxed atomics. `report()` swaps the periodic ones
//! to zero and leaves the monotonic totals in place.
//!
//! NOTE: Relaxed ordering everywhere. These are statistics only, never read
//! them to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Backend round-trip bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400
const BUCKET_BOUNDS: [u64; 9] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400];
const NUM_BUCKETS: usize = 10;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

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
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector shared by the coordinator and its components
pub struct Metrics {
    /// Position samples delivered by the geo stream (monotonic)
    fixes_received: AtomicU64,
    /// Fixes since last report (reset on report)
    fixes_since_report: AtomicU64,
    /// Fixes rejected as inaccurate or stale (monotonic)
    fixes_unreliable: AtomicU64,
    /// Fixes superseded before they could be pushed to the backend (monotonic)
    fixes_dropped: AtomicU64,
    /// Navigation steps or tour points advanced (monotonic)
    steps_advanced: AtomicU64,
    /// Backend requests issued (monotonic)
    backend_requests: AtomicU64,
    /// Backend requests that failed (monotonic)
    backend_errors: AtomicU64,
    /// Backend latency histogram (reset on report)
    backend_latency_buckets: [AtomicU64; NUM_BUCKETS],
    backend_latency_sum_ms: AtomicU64,
    backend_latency_max_ms: AtomicU64,
    /// Utterances handed to the speech engine (monotonic)
    utterances_started: AtomicU64,
    /// Utterances cut short by a newer one or a stop (monotonic)
    utterances_cancelled: AtomicU64,
    /// Speech engine failures (monotonic)
    speech_errors: AtomicU64,
    /// Map commands dropped because the sink was full (monotonic)
    map_commands_dropped: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fixes_received: AtomicU64::new(0),
            fixes_since_report: AtomicU64::new(0),
            fixes_unreliable: AtomicU64::new(0),
            fixes_dropped: AtomicU64::new(0),
            steps_advanced: AtomicU64::new(0),
            backend_requests: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            backend_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            backend_latency_sum_ms: AtomicU64::new(0),
            backend_latency_max_ms: AtomicU64::new(0),
            utterances_started: AtomicU64::new(0),
            utterances_cancelled: AtomicU64::new(0),
            speech_errors: AtomicU64::new(0),
            map_commands_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_fix_received(&self) {
        self.fixes_received.fetch_add(1, Ordering::Relaxed);
        self.fixes_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fix_unreliable(&self) {
        self.fixes_unreliable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fix_dropped(&self) {
        self.fixes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_step_advanced(&self) {
        self.steps_advanced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed backend call and its round-trip time
    #[inline]
    pub fn record_backend_request(&self, latency_ms: u64, ok: bool) {
        self.backend_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.backend_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.backend_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.backend_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_utterance_started(&self) {
        self.utterances_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_utterance_cancelled(&self) {
        self.utterances_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_speech_error(&self) {
        self.speech_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_map_command_dropped(&self) {
        self.map_commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn fixes_received(&self) -> u64 {
        self.fixes_received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fixes_unreliable(&self) -> u64 {
        self.fixes_unreliable.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fixes_dropped(&self) -> u64 {
        self.fixes_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn steps_advanced(&self) -> u64 {
        self.steps_advanced.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn backend_errors(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn utterances_started(&self) -> u64 {
        self.utterances_started.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn utterances_cancelled(&self) -> u64 {
        self.utterances_cancelled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn speech_errors(&self) -> u64 {
        self.speech_errors.load(Ordering::Relaxed)
    }

    /// Snapshot all counters and reset the periodic ones
    pub fn report(&self) -> MetricsSummary {
        let fixes_count = self.fixes_since_report.swap(0, Ordering::Relaxed);
        let latency_buckets = swap_buckets(&self.backend_latency_buckets);
        let latency_sum = self.backend_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.backend_latency_max_ms.swap(0, Ordering::Relaxed);
        let latency_count: u64 = latency_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let fixes_per_min = if elapsed.as_secs_f64() > 0.0 {
            fixes_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            fixes_received: self.fixes_received.load(Ordering::Relaxed),
            fixes_per_min,
            fixes_unreliable: self.fixes_unreliable.load(Ordering::Relaxed),
            fixes_dropped: self.fixes_dropped.load(Ordering::Relaxed),
            steps_advanced: self.steps_advanced.load(Ordering::Relaxed),
            backend_requests: self.backend_requests.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            backend_latency_buckets: latency_buckets,
            backend_latency_avg_ms: if latency_count > 0 { latency_sum / latency_count } else { 0 },
            backend_latency_max_ms: latency_max,
            backend_latency_p95_ms: percentile_from_buckets(&latency_buckets, 0.95),
            utterances_started: self.utterances_started.load(Ordering::Relaxed),
            utterances_cancelled: self.utterances_cancelled.load(Ordering::Relaxed),
            speech_errors: self.speech_errors.load(Ordering::Relaxed),
            map_commands_dropped: self.map_commands_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub fixes_received: u64,
    pub fixes_per_min: f64,
    pub fixes_unreliable: u64,
    pub fixes_dropped: u64,
    pub steps_advanced: u64,
    pub backend_requests: u64,
    pub backend_errors: u64,
    /// Bounds: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400 ms
    pub backend_latency_buckets: [u64; NUM_BUCKETS],
    pub backend_latency_avg_ms: u64,
    pub backend_latency_max_ms: u64,
    pub backend_latency_p95_ms: u64,
    pub utterances_started: u64,
    pub utterances_cancelled: u64,
    pub speech_errors: u64,
    pub map_commands_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            fixes_total = %self.fixes_received,
            fixes_per_min = format!("{:.1}", self.fixes_per_min),
            fixes_unreliable = %self.fixes_unreliable,
            fixes_dropped = %self.fixes_dropped,
            steps_advanced = %self.steps_advanced,
            backend_requests = %self.backend_requests,
            backend_errors = %self.backend_errors,
            backend_avg_ms = %self.backend_latency_avg_ms,
            backend_p95_ms = %self.backend_latency_p95_ms,
            utterances = %self.utterances_started,
            utterances_cancelled = %self.utterances_cancelled,
            speech_errors = %self.speech_errors,
            "metrics"
        );
    }
}
