//! Cache Metrics
//!
//! Process-wide counters and gauges, updated lock-free from the request,
//! eviction, probing and rebalancing paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Weight of the newest sample in the rolling latency average
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    network_errors: AtomicU64,
    rebalance_passes: AtomicU64,
    keys_migrated: AtomicU64,

    memory_usage: AtomicU64,
    node_count: AtomicU64,
    replication_lag_us: AtomicU64,

    /// f64 bits of the rolling average, in microseconds
    latency_avg_us: AtomicU64,
    latency_count: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            rebalance_passes: AtomicU64::new(0),
            keys_migrated: AtomicU64::new(0),
            memory_usage: AtomicU64::new(0),
            node_count: AtomicU64::new(0),
            replication_lag_us: AtomicU64::new(0),
            latency_avg_us: AtomicU64::new(0f64.to_bits()),
            latency_count: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
        }
    }

    /// Record a completed request and its latency
    pub fn record_request(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let latency_us = latency.as_micros() as u64;
        let first = self.latency_count.fetch_add(1, Ordering::Relaxed) == 0;

        let mut current = self.latency_avg_us.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if first {
                latency_us as f64
            } else {
                avg + LATENCY_EWMA_ALPHA * (latency_us as f64 - avg)
            };
            match self.latency_avg_us.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        self.latency_min_us.fetch_min(latency_us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebalance(&self, keys_migrated: u64) {
        self.rebalance_passes.fetch_add(1, Ordering::Relaxed);
        self.keys_migrated.fetch_add(keys_migrated, Ordering::Relaxed);
    }

    pub fn add_memory(&self, bytes: usize) {
        self.memory_usage.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sub_memory(&self, bytes: usize) {
        // saturating: a store may be dropped while the gauge is being read
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |m| {
                Some(m.saturating_sub(bytes as u64))
            });
    }

    pub fn set_node_count(&self, count: usize) {
        self.node_count.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_replication_lag(&self, lag: Duration) {
        self.replication_lag_us
            .store(lag.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter and gauge
    pub fn snapshot(&self) -> MetricsSnapshot {
        let min = self.latency_min_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: self.requests(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions(),
            network_errors: self.network_errors(),
            rebalance_passes: self.rebalance_passes.load(Ordering::Relaxed),
            keys_migrated: self.keys_migrated.load(Ordering::Relaxed),
            memory_usage: self.memory_usage(),
            node_count: self.node_count.load(Ordering::Relaxed) as usize,
            replication_lag: Duration::from_micros(
                self.replication_lag_us.load(Ordering::Relaxed),
            ),
            average_latency: Duration::from_micros(
                f64::from_bits(self.latency_avg_us.load(Ordering::Relaxed)) as u64,
            ),
            min_latency: Duration::from_micros(if min == u64::MAX { 0 } else { min }),
            max_latency: Duration::from_micros(self.latency_max_us.load(Ordering::Relaxed)),
        }
    }
}

/// Copy of the metrics at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub network_errors: u64,
    pub rebalance_passes: u64,
    pub keys_migrated: u64,
    pub memory_usage: u64,
    pub node_count: usize,
    pub replication_lag: Duration,
    pub average_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }

    /// Network errors per request
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.network_errors as f64 / self.total_requests as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "Requests: {} | Hit rate: {:.1}% | Evictions: {} | Memory: {}B | Nodes: {} | Latency (µs): avg={}, min={}, max={}",
            self.total_requests,
            self.hit_rate() * 100.0,
            self.evictions,
            self.memory_usage,
            self.node_count,
            self.average_latency.as_micros(),
            self.min_latency.as_micros(),
            self.max_latency.as_micros()
        )
    }
}

/// Destination for published metric snapshots
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &MetricsSnapshot);
}

/// Sink that writes the summary line to the log
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        info!(target: "ringcache::metrics", "{}", snapshot.summary());
    }
}

/// Levels at which the reporter logs a warning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Network errors per request
    pub max_error_rate: f64,
    /// Cluster memory usage relative to the total budget
    pub max_memory_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_memory_ratio: 0.9,
        }
    }
}

impl AlertThresholds {
    /// Names of the thresholds the snapshot crosses
    pub fn breaches(&self, snapshot: &MetricsSnapshot, memory_budget: u64) -> Vec<&'static str> {
        let mut breached = Vec::new();
        if snapshot.error_rate() > self.max_error_rate {
            breached.push("error_rate");
        }
        if memory_budget > 0
            && snapshot.memory_usage as f64 / memory_budget as f64 > self.max_memory_ratio
        {
            breached.push("memory");
        }
        breached
    }
}

/// Background task publishing snapshots to a sink
pub struct MetricsReporter {
    metrics: Arc<CacheMetrics>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    alerts: AlertThresholds,
    /// Per-node budget; multiplied by the node count for the memory alert
    node_memory: u64,
}

impl MetricsReporter {
    pub fn new(
        metrics: Arc<CacheMetrics>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
        alerts: AlertThresholds,
        node_memory: usize,
    ) -> Self {
        Self {
            metrics,
            sink,
            interval,
            alerts,
            node_memory: node_memory as u64,
        }
    }

    /// Publish one snapshot and check it against the thresholds
    pub fn report(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot();
        self.sink.publish(&snapshot);

        let budget = self.node_memory * snapshot.node_count as u64;
        for alert in self.alerts.breaches(&snapshot, budget) {
            warn!(
                alert,
                error_rate = snapshot.error_rate(),
                memory = snapshot.memory_usage,
                "Metrics threshold exceeded"
            );
        }
        snapshot
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
