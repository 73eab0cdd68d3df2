//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Sensor callbacks record here, so nothing in this module may block.
//!
//! All atomics use Relaxed ordering: statistical counters only, never used
//! for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
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

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Latency histogram with running sum and max
struct Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(&self, value_us: u64) {
        self.buckets[bucket_index(value_us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.max_us, value_us);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let buckets = load_buckets(&self.buckets);
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets,
            count,
            sum_us: sum,
            avg_us: if count > 0 { sum / count } else { 0 },
            max_us: self.max_us.load(Ordering::Relaxed),
            p50_us: percentile_from_buckets(&buckets, 0.50),
            p99_us: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramSnapshot {
    pub buckets: [u64; NUM_BUCKETS],
    pub count: u64,
    pub sum_us: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Triggers forwarded to the state machine
    triggers_accepted: AtomicU64,
    /// Triggers suppressed by the debounce window
    triggers_debounced: AtomicU64,
    /// Sensor signals lost because the input queue was full
    signals_dropped: AtomicU64,
    /// Readings refused by the state machine (lane resolved, not racing)
    readings_rejected: AtomicU64,
    /// Sensor faults reported
    sensor_faults: AtomicU64,
    races_started: AtomicU64,
    races_finished: AtomicU64,
    races_faulted: AtomicU64,
    races_timed_out: AtomicU64,
    commands_ok: AtomicU64,
    commands_rejected: AtomicU64,
    command_timeouts: AtomicU64,
    events_published: AtomicU64,
    /// Events dropped from lagging observer queues
    events_overflowed: AtomicU64,
    /// Input processing latency in the race controller
    input_latency: Histogram,
    /// Hardware command acknowledgment latency
    ack_latency: Histogram,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            triggers_accepted: AtomicU64::new(0),
            triggers_debounced: AtomicU64::new(0),
            signals_dropped: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            sensor_faults: AtomicU64::new(0),
            races_started: AtomicU64::new(0),
            races_finished: AtomicU64::new(0),
            races_faulted: AtomicU64::new(0),
            races_timed_out: AtomicU64::new(0),
            commands_ok: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            command_timeouts: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_overflowed: AtomicU64::new(0),
            input_latency: Histogram::new(),
            ack_latency: Histogram::new(),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn record_trigger_accepted(&self) {
        self.triggers_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trigger_debounced(&self) {
        self.triggers_debounced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_signal_dropped(&self) {
        self.signals_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading_rejected(&self) {
        self.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sensor_fault(&self) {
        self.sensor_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_started(&self) {
        self.races_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_finished(&self) {
        self.races_finished.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_faulted(&self) {
        self.races_faulted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_timed_out(&self) {
        self.races_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_ok(&self) {
        self.commands_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_timeout(&self) {
        self.command_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_overflow(&self) {
        self.events_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_input_processed(&self, latency_us: u64) {
        self.input_latency.record(latency_us);
    }

    #[inline]
    pub fn record_ack_latency(&self, latency_us: u64) {
        self.ack_latency.record(latency_us);
    }

    /// Consistent-enough snapshot of all counters
    pub fn report(&self) -> MetricsSummary {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            triggers_accepted: load(&self.triggers_accepted),
            triggers_debounced: load(&self.triggers_debounced),
            signals_dropped: load(&self.signals_dropped),
            readings_rejected: load(&self.readings_rejected),
            sensor_faults: load(&self.sensor_faults),
            races_started: load(&self.races_started),
            races_finished: load(&self.races_finished),
            races_faulted: load(&self.races_faulted),
            races_timed_out: load(&self.races_timed_out),
            commands_ok: load(&self.commands_ok),
            commands_rejected: load(&self.commands_rejected),
            command_timeouts: load(&self.command_timeouts),
            events_published: load(&self.events_published),
            events_overflowed: load(&self.events_overflowed),
            input_latency: self.input_latency.snapshot(),
            ack_latency: self.ack_latency.snapshot(),
        }
    }
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub triggers_accepted: u64,
    pub triggers_debounced: u64,
    pub signals_dropped: u64,
    pub readings_rejected: u64,
    pub sensor_faults: u64,
    pub races_started: u64,
    pub races_finished: u64,
    pub races_faulted: u64,
    pub races_timed_out: u64,
    pub commands_ok: u64,
    pub commands_rejected: u64,
    pub command_timeouts: u64,
    pub events_published: u64,
    pub events_overflowed: u64,
    pub input_latency: HistogramSnapshot,
    pub ack_latency: HistogramSnapshot,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            races_started = %self.races_started,
            races_finished = %self.races_finished,
            races_faulted = %self.races_faulted,
            races_timed_out = %self.races_timed_out,
            triggers = %self.triggers_accepted,
            debounced = %self.triggers_debounced,
            signals_dropped = %self.signals_dropped,
            commands_ok = %self.commands_ok,
            commands_rejected = %self.commands_rejected,
            command_timeouts = %self.command_timeouts,
            events_published = %self.events_published,
            events_overflowed = %self.events_overflowed,
            input_p99_us = %self.input_latency.p99_us,
            ack_avg_us = %self.ack_latency.avg_us,
            ack_max_us = %self.ack_latency.max_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(60000), 10);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_counters_and_histograms() {
        let metrics = Metrics::new();
        metrics.record_trigger_accepted();
        metrics.record_trigger_accepted();
        metrics.record_trigger_debounced();
        metrics.record_race_started();
        metrics.record_ack_latency(150);
        metrics.record_ack_latency(250);

        let summary = metrics.report();
        assert_eq!(summary.triggers_accepted, 2);
        assert_eq!(summary.triggers_debounced, 1);
        assert_eq!(summary.races_started, 1);
        assert_eq!(summary.ack_latency.count, 2);
        assert_eq!(summary.ack_latency.avg_us, 200);
        assert_eq!(summary.ack_latency.max_us, 250);
        assert_eq!(summary.ack_latency.buckets[1], 1);
        assert_eq!(summary.ack_latency.buckets[2], 1);
    }
}
