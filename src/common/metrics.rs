//! Per-node metrics
//!
//! Prometheus-compatible counters, gauges and latency histograms for the
//! storage engine, the replication coordinator and the membership layer.
//! Each node owns its registry so several nodes can share one process.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    /// Sum of observations in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, millis: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64() * 1000.0);
    }

    /// Cumulative `(upper bound, count)` pairs ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        self.boundaries
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(self.buckets.iter())
            .map(|(bound, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (bound, running)
            })
            .collect()
    }

    /// Sum of observations in milliseconds
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time value
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics registry of one storage node
#[derive(Debug)]
pub struct NodeMetrics {
    // coordinator
    pub writes: Counter,
    pub reads: Counter,
    pub unavailable: Counter,
    pub timeouts: Counter,
    pub stale_ring_retries: Counter,
    pub write_latency: Histogram,
    pub read_latency: Histogram,

    // hinted handoff / read repair
    pub hints_stored: Counter,
    pub hints_delivered: Counter,
    pub hints_dropped: Counter,
    pub read_repairs: Counter,
    pub read_repair_failures: Counter,

    // storage engine
    pub commitlog_appends: Counter,
    pub memtable_flushes: Counter,
    pub compactions: Counter,
    pub tombstones_purged: Counter,
    pub filter_skips: Counter,
    pub sstables_quarantined: Counter,
    pub live_sstables: Gauge,

    // membership
    pub gossip_rounds: Counter,
    pub live_peers: Gauge,
    pub ring_version: Gauge,

    start_time: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            writes: Counter::new(),
            reads: Counter::new(),
            unavailable: Counter::new(),
            timeouts: Counter::new(),
            stale_ring_retries: Counter::new(),
            write_latency: Histogram::new(),
            read_latency: Histogram::new(),
            hints_stored: Counter::new(),
            hints_delivered: Counter::new(),
            hints_dropped: Counter::new(),
            read_repairs: Counter::new(),
            read_repair_failures: Counter::new(),
            commitlog_appends: Counter::new(),
            memtable_flushes: Counter::new(),
            compactions: Counter::new(),
            tombstones_purged: Counter::new(),
            filter_skips: Counter::new(),
            sstables_quarantined: Counter::new(),
            live_sstables: Gauge::new(),
            gossip_rounds: Counter::new(),
            live_peers: Gauge::new(),
            ring_version: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 17] = [
            ("writes_total", "Coordinated writes", &self.writes),
            ("reads_total", "Coordinated reads", &self.reads),
            ("unavailable_total", "Operations failed for lack of replicas", &self.unavailable),
            ("timeouts_total", "Replica requests that timed out", &self.timeouts),
            ("stale_ring_retries_total", "Operations retried on a refreshed ring", &self.stale_ring_retries),
            ("hints_stored_total", "Hints stored for unreachable replicas", &self.hints_stored),
            ("hints_delivered_total", "Hints delivered after a replica returned", &self.hints_delivered),
            ("hints_dropped_total", "Hints dropped past the retention window", &self.hints_dropped),
            ("read_repairs_total", "Read repair writes sent", &self.read_repairs),
            ("read_repair_failures_total", "Read repair writes that failed", &self.read_repair_failures),
            ("commitlog_appends_total", "Commit log appends", &self.commitlog_appends),
            ("memtable_flushes_total", "Memtables flushed to sstables", &self.memtable_flushes),
            ("compactions_total", "Compactions completed", &self.compactions),
            ("tombstones_purged_total", "Partitions purged of expired tombstones", &self.tombstones_purged),
            ("filter_skips_total", "SSTable probes skipped by the membership filter", &self.filter_skips),
            ("sstables_quarantined_total", "SSTables quarantined after corruption", &self.sstables_quarantined),
            ("gossip_rounds_total", "Gossip rounds initiated", &self.gossip_rounds),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP ringkv_{} {}", name, help);
            let _ = writeln!(out, "# TYPE ringkv_{} counter", name);
            let _ = writeln!(out, "ringkv_{} {}", name, counter.get());
        }

        for (name, help, value) in [
            ("live_sstables", "SSTables in the live set", self.live_sstables.get()),
            ("live_peers", "Peers currently considered alive", self.live_peers.get()),
            ("ring_version", "Current ring view version", self.ring_version.get()),
            ("uptime_seconds", "Node uptime in seconds", self.uptime_seconds()),
        ] {
            let _ = writeln!(out, "# HELP ringkv_{} {}", name, help);
            let _ = writeln!(out, "# TYPE ringkv_{} gauge", name);
            let _ = writeln!(out, "ringkv_{} {}", name, value);
        }

        for (name, hist) in [
            ("write_duration_ms", &self.write_latency),
            ("read_duration_ms", &self.read_latency),
        ] {
            let _ = writeln!(out, "# TYPE ringkv_{} histogram", name);
            for (le, count) in hist.cumulative() {
                if le.is_infinite() {
                    let _ = writeln!(out, "ringkv_{}_bucket{{le=\"+Inf\"}} {}", name, count);
                } else {
                    let _ = writeln!(out, "ringkv_{}_bucket{{le=\"{}\"}} {}", name, le, count);
                }
            }
            let _ = writeln!(out, "ringkv_{}_sum {}", name, hist.sum());
            let _ = writeln!(out, "ringkv_{}_count {}", name, hist.count());
        }

        out
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.cumulative();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = NodeMetrics::new();
        metrics.writes.inc();
        metrics.hints_stored.add(2);
        metrics.write_latency.observe_duration(Duration::from_millis(3));

        let text = metrics.to_prometheus();
        assert!(text.contains("ringkv_writes_total 1"));
        assert!(text.contains("ringkv_hints_stored_total 2"));
        assert!(text.contains("ringkv_write_duration_ms_count 1"));
        assert!(text.contains("le=\"+Inf\""));
    }
}
