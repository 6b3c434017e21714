//! Pool statistics: read-only observability surface.
//!
//! Counters are lock-free atomics updated on the request path. The wait-time
//! histogram uses fixed millisecond buckets so that snapshots from several
//! managed pools can be merged into one view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds (inclusive, milliseconds) of the wait-time histogram buckets.
/// A final overflow bucket catches everything slower.
pub const WAIT_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1_000, 5_000];

/// Live counters for one managed connection pool.
#[derive(Debug, Default)]
pub struct PoolStatistics {
    created: AtomicU64,
    destroyed: AtomicU64,
    timed_out: AtomicU64,
    blocking_failures: AtomicU64,
    wait_count: AtomicU64,
    total_blocking_ms: AtomicU64,
    max_wait_ms: AtomicU64,
    total_creation_ms: AtomicU64,
    max_creation_ms: AtomicU64,
    max_used: AtomicU64,
    wait_histogram: [AtomicU64; WAIT_BUCKETS_MS.len() + 1],
}

impl PoolStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self, took: Duration) {
        let ms = took.as_millis() as u64;
        self.created.fetch_add(1, Ordering::Relaxed);
        self.total_creation_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_creation_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self, count: u64) {
        self.timed_out.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_blocking_failure(&self) {
        self.blocking_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller found the pool full and had to queue.
    pub(crate) fn record_queued(&self) {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Time a caller spent obtaining a permit, whether or not it queued.
    pub(crate) fn record_wait(&self, waited: Duration) {
        let ms = waited.as_millis() as u64;
        self.total_blocking_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(ms, Ordering::Relaxed);
        let bucket = WAIT_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(WAIT_BUCKETS_MS.len());
        self.wait_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_in_use(&self, in_use: usize) {
        self.max_used.fetch_max(in_use as u64, Ordering::Relaxed);
    }

    /// Freeze the counters, combined with the pool's current occupancy.
    pub fn snapshot(&self, active: usize, idle: usize) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            active,
            idle,
            created: load(&self.created),
            destroyed: load(&self.destroyed),
            timed_out: load(&self.timed_out),
            blocking_failures: load(&self.blocking_failures),
            wait_count: load(&self.wait_count),
            total_blocking_ms: load(&self.total_blocking_ms),
            max_wait_ms: load(&self.max_wait_ms),
            total_creation_ms: load(&self.total_creation_ms),
            max_creation_ms: load(&self.max_creation_ms),
            max_used: load(&self.max_used),
            wait_histogram: self.wait_histogram.iter().map(load).collect(),
        }
    }
}

/// Point-in-time copy of a pool's statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Listeners leased to callers.
    pub active: usize,
    /// Listeners waiting in the idle set.
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
    /// Listeners reaped by idle timeout.
    pub timed_out: u64,
    /// Acquires that hit the blocking timeout.
    pub blocking_failures: u64,
    /// Acquires that found the pool full and queued.
    pub wait_count: u64,
    pub total_blocking_ms: u64,
    pub max_wait_ms: u64,
    pub total_creation_ms: u64,
    pub max_creation_ms: u64,
    /// High-water mark of leased listeners.
    pub max_used: u64,
    /// Counts per bucket of [`WAIT_BUCKETS_MS`], plus the overflow bucket.
    pub wait_histogram: Vec<u64>,
}

impl StatisticsSnapshot {
    /// `active + idle`.
    pub fn total(&self) -> usize {
        self.active + self.idle
    }

    pub fn average_creation_ms(&self) -> u64 {
        self.total_creation_ms.checked_div(self.created).unwrap_or(0)
    }

    /// Fold another managed pool's snapshot into this one.
    pub fn merge(&mut self, other: &StatisticsSnapshot) {
        self.active += other.active;
        self.idle += other.idle;
        self.created += other.created;
        self.destroyed += other.destroyed;
        self.timed_out += other.timed_out;
        self.blocking_failures += other.blocking_failures;
        self.wait_count += other.wait_count;
        self.total_blocking_ms += other.total_blocking_ms;
        self.max_wait_ms = self.max_wait_ms.max(other.max_wait_ms);
        self.total_creation_ms += other.total_creation_ms;
        self.max_creation_ms = self.max_creation_ms.max(other.max_creation_ms);
        self.max_used += other.max_used;
        if self.wait_histogram.len() < other.wait_histogram.len() {
            self.wait_histogram.resize(other.wait_histogram.len(), 0);
        }
        for (mine, theirs) in self.wait_histogram.iter_mut().zip(&other.wait_histogram) {
            *mine += theirs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot() {
        let stats = PoolStatistics::new();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.created, 0);
        assert_eq!(snap.total(), 0);
        assert_eq!(snap.wait_histogram.len(), WAIT_BUCKETS_MS.len() + 1);
        assert!(snap.wait_histogram.iter().all(|&c| c == 0));
    }

    #[test]
    fn wait_histogram_buckets() {
        let stats = PoolStatistics::new();
        stats.record_wait(Duration::ZERO);
        stats.record_wait(Duration::from_millis(7));
        stats.record_wait(Duration::from_millis(100));
        stats.record_wait(Duration::from_secs(60));

        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.wait_histogram[0], 1); // <= 1ms
        assert_eq!(snap.wait_histogram[2], 1); // <= 10ms
        assert_eq!(snap.wait_histogram[4], 1); // <= 100ms
        assert_eq!(snap.wait_histogram[WAIT_BUCKETS_MS.len()], 1); // overflow
        assert_eq!(snap.max_wait_ms, 60_000);
    }

    #[test]
    fn creation_timings() {
        let stats = PoolStatistics::new();
        stats.record_created(Duration::from_millis(10));
        stats.record_created(Duration::from_millis(30));

        let snap = stats.snapshot(2, 0);
        assert_eq!(snap.created, 2);
        assert_eq!(snap.max_creation_ms, 30);
        assert_eq!(snap.average_creation_ms(), 20);
    }

    #[test]
    fn merge_sums_counters_and_maxes_peaks() {
        let a = PoolStatistics::new();
        a.record_created(Duration::from_millis(5));
        a.record_wait(Duration::from_millis(200));
        let b = PoolStatistics::new();
        b.record_created(Duration::from_millis(9));
        b.record_destroyed();
        b.record_wait(Duration::from_millis(3));

        let mut merged = a.snapshot(1, 2);
        merged.merge(&b.snapshot(0, 1));

        assert_eq!(merged.active, 1);
        assert_eq!(merged.idle, 3);
        assert_eq!(merged.created, 2);
        assert_eq!(merged.destroyed, 1);
        assert_eq!(merged.max_wait_ms, 200);
        assert_eq!(merged.max_creation_ms, 9);
        assert_eq!(merged.wait_histogram.iter().sum::<u64>(), 2);
    }

    #[test]
    fn merge_into_default_adopts_histogram_shape() {
        let stats = PoolStatistics::new();
        stats.record_wait(Duration::from_millis(2));
        let mut total = StatisticsSnapshot::default();
        total.merge(&stats.snapshot(0, 0));
        assert_eq!(total.wait_histogram.len(), WAIT_BUCKETS_MS.len() + 1);
        assert_eq!(total.wait_histogram[1], 1);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = PoolStatistics::new().snapshot(1, 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"active\":1"));
    }
}
