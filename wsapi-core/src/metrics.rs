//! Engine metrics
//!
//! Counters for cache effectiveness and computation cost, plus the
//! serializable [`EngineStats`] snapshot exposed by the server.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one cache engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Subscriptions served from an existing entry
    pub hit_count: AtomicU64,

    /// Subscriptions that had to create an entry
    pub miss_count: AtomicU64,

    /// Entries created by a `prepare` list
    pub prepared_count: AtomicU64,

    /// Completed `get` computations
    pub computation_count: AtomicU64,

    /// Failed `get` or `set` calls
    pub failure_count: AtomicU64,

    /// Entries recomputed because a tag was invalidated
    pub recompute_count: AtomicU64,

    /// Entries marked stale instead of being recomputed
    pub stale_count: AtomicU64,

    /// Entries removed by a sweep
    pub swept_count: AtomicU64,

    /// Total time spent in `get` functions (nanoseconds)
    pub total_compute_time_ns: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prepared(&self) {
        self.prepared_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_computation(&self, duration: Duration) {
        self.computation_count.fetch_add(1, Ordering::Relaxed);
        self.total_compute_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recompute(&self) {
        self.recompute_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, n: usize) {
        self.swept_count.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed) as f64;
        let total = hits + self.miss_count.load(Ordering::Relaxed) as f64;

        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get average computation time
    pub fn avg_compute_time(&self) -> Duration {
        let total_ns = self.total_compute_time_ns.load(Ordering::Relaxed);
        let count = self.computation_count.load(Ordering::Relaxed);

        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_ns / count)
        }
    }

    /// Get a snapshot of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            prepared: self.prepared_count.load(Ordering::Relaxed),
            computations: self.computation_count.load(Ordering::Relaxed),
            failures: self.failure_count.load(Ordering::Relaxed),
            recomputes: self.recompute_count.load(Ordering::Relaxed),
            stale_marks: self.stale_count.load(Ordering::Relaxed),
            swept: self.swept_count.load(Ordering::Relaxed),
            avg_compute_ms: self.avg_compute_time().as_secs_f64() * 1000.0,
        }
    }
}

/// A point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub prepared: u64,
    pub computations: u64,
    pub failures: u64,
    pub recomputes: u64,
    pub stale_marks: u64,
    pub swept: u64,
    pub avg_compute_ms: f64,
}

/// Engine state sizes plus counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Live cache entries
    pub entries: usize,
    /// Entries with at least one subscriber
    pub subscribed_entries: usize,
    /// Total (session, id) subscriptions
    pub subscriptions: usize,
    /// Tags with at least one dependent entry
    pub tags: usize,
    /// Entries queued for the next sweep
    pub sweep_queue: usize,
    pub metrics: MetricsSnapshot,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine Statistics:")?;
        writeln!(
            f,
            "  Entries: {} ({} subscribed) | Subscriptions: {} | Tags: {}",
            self.entries, self.subscribed_entries, self.subscriptions, self.tags
        )?;
        writeln!(
            f,
            "  Hits: {} | Misses: {} | Computations: {} | Failures: {}",
            self.metrics.hits,
            self.metrics.misses,
            self.metrics.computations,
            self.metrics.failures
        )?;
        writeln!(
            f,
            "  Sweep Queue: {} | Swept: {} | Avg Time: {:.2}ms",
            self.sweep_queue, self.metrics.swept, self.metrics.avg_compute_ms
        )?;
        Ok(())
    }
}
