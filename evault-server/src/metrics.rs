//! # Server Metrics
//!
//! Counters reported by `INFO`: processed commands, error replies, live
//! connections and a coarse latency histogram.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events without locks.
//! 2. **Fixed Buckets**: Histogram buckets live in one contiguous array.
//! 3. **Plain Snapshots**: Readers get a copy and never hold anything shared.
//!
//! `Ordering::Relaxed` is enough everywhere: fields are independent and a
//! report only needs each counter to be eventually accurate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 50_000, 100_000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commands_total: u64,
    pub errors_total: u64,
    pub connected_clients: u64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, with the overflow bucket last.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

impl LatencySnapshot {
    pub fn mean_us(&self) -> u64 {
        self.sum_us.checked_div(self.samples).unwrap_or(0)
    }

    /// Upper bound of the bucket holding the `q` quantile (0.0..=1.0).
    /// Samples in the overflow bucket report the largest boundary.
    pub fn quantile_us(&self, q: f64) -> u64 {
        if self.samples == 0 {
            return 0;
        }
        let rank = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return self
                    .bounds_us
                    .get(idx)
                    .or_else(|| self.bounds_us.last())
                    .copied()
                    .unwrap_or(0);
            }
        }
        self.bounds_us.last().copied().unwrap_or(0)
    }
}

/// Process-wide server counters.
pub struct Metrics {
    commands_total: AtomicU64,
    errors_total: AtomicU64,
    connected_clients: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// `bounds_us` must be sorted ascending.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        Metrics {
            commands_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Records one executed request and whether its reply was an error.
    pub fn record_command(&self, latency: Duration, is_error: bool) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        // First bucket whose bound is >= the sample; past the end is overflow.
        let idx = self.bounds_us.partition_point(|&bound| bound < micros);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
