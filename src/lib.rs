//! ringcache - Distributed In-Memory Cache
//!
//! Shards keys across a dynamic set of nodes with consistent hashing,
//! replicates them under configurable quorums, and reclaims memory with
//! pluggable eviction policies. Failed nodes are detected by probing and
//! their keys are re-replicated automatically.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;

pub use cache::{DeleteOutcome, DistributedCache};
pub use cluster::{
    ConsistencyLevel, HashRing, LocalTransport, Node, NodeId, NodeRegistry, NodeTransport,
    RebalanceReport, ReplicationStrategy,
};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use metrics::{CacheMetrics, MetricsSink, MetricsSnapshot, TracingSink};
pub use storage::{CacheItem, EvictionPolicy, Store};
