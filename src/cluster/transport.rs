//! Node Transport
//!
//! How one node reaches another's store. The cache only needs
//! request/response semantics; any RPC mechanism can implement
//! [`NodeTransport`]. [`LocalTransport`] hosts every node's store in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::node::{Node, NodeId};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::storage::{CacheItem, EvictionConfig, Record, Store, TtlSweeper};

/// Health probe answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub items: usize,
    pub memory: usize,
    pub max_memory: usize,
}

impl ProbeReport {
    /// Memory in use relative to the budget; None when unlimited
    pub fn load_factor(&self) -> Option<f64> {
        if self.max_memory == 0 {
            return None;
        }
        Some(self.memory as f64 / self.max_memory as f64)
    }
}

/// Replica operations against a single remote node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Open whatever channel the transport needs before a node is used
    async fn connect(&self, _node: &Node) -> Result<()> {
        Ok(())
    }

    /// Release the channel of a node that left the cluster
    async fn disconnect(&self, _node_id: &str) {}

    /// Store a replica; `Ok(false)` if the node already held a newer version
    async fn put(&self, node_id: &str, item: CacheItem) -> Result<bool>;

    /// The node's live copy, or the tombstone of its last delete
    async fn get(&self, node_id: &str, key: &str) -> Result<Option<Record>>;

    /// Delete as of `deleted_at`, leaving a tombstone. Returns true if the
    /// node held a live copy.
    async fn delete(&self, node_id: &str, key: &str, deleted_at: DateTime<Utc>) -> Result<bool>;

    /// Drop a copy the node no longer owns without recording a delete
    async fn discard(&self, node_id: &str, key: &str) -> Result<bool>;

    /// Every live item and tombstone on the node
    async fn scan(&self, node_id: &str) -> Result<Vec<Record>>;

    async fn probe(&self, node_id: &str) -> Result<ProbeReport>;
}

struct LocalNode {
    store: Arc<Store>,
    reachable: AtomicBool,
    latency_us: AtomicU64,
    sweeper: CancellationToken,
}

/// In-process transport: one store per connected node.
///
/// Reachability and latency can be set per node to simulate partitions and
/// slow replicas.
pub struct LocalTransport {
    nodes: DashMap<NodeId, Arc<LocalNode>>,
    eviction: EvictionConfig,
    sweep_interval: Duration,
    metrics: Arc<CacheMetrics>,
    shutdown: CancellationToken,
}

impl LocalTransport {
    pub fn new(
        eviction: EvictionConfig,
        sweep_interval: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            eviction,
            sweep_interval,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &CacheConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self::new(config.eviction_config(), config.ttl_sweep_interval, metrics)
    }

    /// Direct handle to a node's store
    pub fn store(&self, node_id: &str) -> Option<Arc<Store>> {
        self.nodes.get(node_id).map(|n| n.store.clone())
    }

    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        if let Some(node) = self.nodes.get(node_id) {
            debug!(node = %node_id, reachable, "Setting reachability");
            node.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Delay every call to a node by `latency`
    pub fn set_latency(&self, node_id: &str, latency: Duration) {
        if let Some(node) = self.nodes.get(node_id) {
            node.latency_us
                .store(latency.as_micros() as u64, Ordering::SeqCst);
        }
    }

    pub fn connected(&self) -> usize {
        self.nodes.len()
    }

    async fn node(&self, node_id: &str) -> Result<Arc<LocalNode>> {
        let node = self
            .nodes
            .get(node_id)
            .map(|n| n.value().clone())
            .ok_or_else(|| CacheError::unreachable(node_id, "not connected"))?;

        let latency = node.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if !node.reachable.load(Ordering::SeqCst) {
            return Err(CacheError::unreachable(node_id, "connection refused"));
        }
        Ok(node)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn connect(&self, node: &Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Ok(());
        }

        let store = Arc::new(Store::new(self.eviction.clone(), self.metrics.clone()));
        let sweeper = self.shutdown.child_token();
        TtlSweeper::spawn(store.clone(), self.sweep_interval, sweeper.clone());

        self.nodes.insert(
            node.id.clone(),
            Arc::new(LocalNode {
                store,
                reachable: AtomicBool::new(true),
                latency_us: AtomicU64::new(0),
                sweeper,
            }),
        );
        info!(node = %node.id, "Connected node store");
        Ok(())
    }

    async fn disconnect(&self, node_id: &str) {
        if let Some((_, node)) = self.nodes.remove(node_id) {
            node.sweeper.cancel();
            let released = node.store.clear();
            info!(node = %node_id, released, "Disconnected node store");
        }
    }

    async fn put(&self, node_id: &str, item: CacheItem) -> Result<bool> {
        self.node(node_id).await?.store.put(item)
    }

    async fn get(&self, node_id: &str, key: &str) -> Result<Option<Record>> {
        Ok(self.node(node_id).await?.store.read(key))
    }

    async fn delete(&self, node_id: &str, key: &str, deleted_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.node(node_id).await?.store.delete(key, deleted_at))
    }

    async fn discard(&self, node_id: &str, key: &str) -> Result<bool> {
        Ok(self.node(node_id).await?.store.discard(key))
    }

    async fn scan(&self, node_id: &str) -> Result<Vec<Record>> {
        Ok(self.node(node_id).await?.store.records())
    }

    async fn probe(&self, node_id: &str) -> Result<ProbeReport> {
        let stats = self.node(node_id).await?.store.stats();
        Ok(ProbeReport {
            items: stats.items,
            memory: stats.memory,
            max_memory: stats.max_memory,
        })
    }
}
