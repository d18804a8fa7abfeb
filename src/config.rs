//! Cache Configuration

use std::time::Duration;

use crate::cluster::{ConsistencyLevel, HealthConfig, ReplicationStrategy};
use crate::error::{CacheError, Result};
use crate::metrics::AlertThresholds;
use crate::storage::{EvictionConfig, EvictionPolicy};

/// Cluster-wide cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Ring positions per physical node
    pub virtual_nodes: usize,

    /// Replica count, consistency level and quorum sizes
    pub replication: ReplicationStrategy,

    /// Eviction policy used by every node's store
    pub eviction_policy: EvictionPolicy,

    /// Memory budget per node in bytes (0 = unlimited)
    pub max_memory: usize,

    /// Interval between probes of the same node
    pub health_check_interval: Duration,

    /// Probe timeout, also used as the per-call replica timeout
    pub probe_timeout: Duration,

    /// Consecutive failed probes before a node is declared dead
    pub failure_threshold: u32,

    /// Interval of the background TTL sweep
    pub ttl_sweep_interval: Duration,

    /// How long replicas remember a delete. A replica that missed the delete
    /// and stays away longer can bring the key back.
    pub tombstone_ttl: Duration,

    /// Extra write attempts per failed replica while quorum is unmet
    pub write_retries: usize,

    /// How often metrics are published to the sink (None = never)
    pub metrics_interval: Option<Duration>,

    pub alerts: AlertThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: 150,
            replication: ReplicationStrategy::default(),
            eviction_policy: EvictionPolicy::Lru,
            max_memory: 1024 * 1024 * 1024, // 1GB
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            ttl_sweep_interval: Duration::from_secs(10),
            tombstone_ttl: Duration::from_secs(3600),
            write_retries: 1,
            metrics_interval: Some(Duration::from_secs(60)),
            alerts: AlertThresholds::default(),
        }
    }
}

impl CacheConfig {
    pub fn with_virtual_nodes(mut self, n: usize) -> Self {
        self.virtual_nodes = n;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationStrategy) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.replication.consistency = level;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_ttl_sweep_interval(mut self, interval: Duration) -> Self {
        self.ttl_sweep_interval = interval;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    pub fn with_write_retries(mut self, retries: usize) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Option<Duration>) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Reject settings that would break quorum arithmetic or the probe loops.
    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(CacheError::InvalidConfig(
                "virtual_nodes must be at least 1".to_string(),
            ));
        }
        self.replication.validate()?;
        if self.failure_threshold == 0 {
            return Err(CacheError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(CacheError::InvalidConfig(
                "probe_timeout must be non-zero".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() || self.ttl_sweep_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "background intervals must be non-zero".to_string(),
            ));
        }
        if self.tombstone_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "tombstone_ttl must be non-zero".to_string(),
            ));
        }
        if matches!(self.metrics_interval, Some(d) if d.is_zero()) {
            return Err(CacheError::InvalidConfig(
                "metrics_interval must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig::default()
            .with_max_memory(self.max_memory)
            .with_policy(self.eviction_policy)
            .with_tombstone_ttl(self.tombstone_ttl)
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: self.health_check_interval,
            probe_timeout: self.probe_timeout,
            failure_threshold: self.failure_threshold,
        }
    }
}
