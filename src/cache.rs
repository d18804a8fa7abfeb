//! Distributed Cache
//!
//! Public entry point. Owns the registry, the replication coordinator, the
//! rebalancer and the health monitor, and runs the loop that applies
//! membership events to the ring.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    HealthMonitor, MembershipEvent, Node, NodeRegistry, NodeTransport, RebalanceReport,
    Rebalancer, ReplicationCoordinator,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics::{CacheMetrics, MetricsReporter, MetricsSink, MetricsSnapshot, TracingSink};
use crate::storage::CacheItem;

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No replica held the key
    NotFound,
}

/// Replicated key-value cache over a set of nodes
pub struct DistributedCache {
    config: CacheConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    coordinator: ReplicationCoordinator,
    rebalancer: Arc<Rebalancer>,
    health: Arc<HealthMonitor>,
    metrics: Arc<CacheMetrics>,
    shutdown: CancellationToken,
}

impl DistributedCache {
    /// Create a cache publishing metrics to the log.
    ///
    /// Must be called inside a tokio runtime; background tasks are spawned
    /// immediately.
    pub fn new(
        config: CacheConfig,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        Self::with_sink(config, transport, metrics, Arc::new(TracingSink))
    }

    pub fn with_sink(
        config: CacheConfig,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<CacheMetrics>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(NodeRegistry::new(config.virtual_nodes));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let coordinator = ReplicationCoordinator::new(
            &config,
            registry.clone(),
            transport.clone(),
            metrics.clone(),
        );
        let rebalancer = Arc::new(Rebalancer::new(
            &config,
            registry.clone(),
            transport.clone(),
            metrics.clone(),
            events_tx.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health_config(),
            registry.clone(),
            transport.clone(),
            events_tx,
            shutdown.child_token(),
        ));

        let membership = MembershipLoop {
            registry: registry.clone(),
            rebalancer: rebalancer.clone(),
            health: health.clone(),
            metrics: metrics.clone(),
            cancel: shutdown.child_token(),
        };
        tokio::spawn(membership.run(events_rx));

        if let Some(interval) = config.metrics_interval {
            MetricsReporter::new(
                metrics.clone(),
                sink,
                interval,
                config.alerts,
                config.max_memory,
            )
            .spawn(shutdown.child_token());
        }

        info!(
            virtual_nodes = config.virtual_nodes,
            replication_factor = config.replication.replication_factor,
            consistency = ?config.replication.consistency,
            eviction = ?config.eviction_policy,
            "Cache started"
        );

        Ok(Self {
            config,
            registry,
            transport,
            coordinator,
            rebalancer,
            health,
            metrics,
            shutdown,
        })
    }

    /// Read a key; `None` if no replica holds a live copy
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let started = Instant::now();
        let result = self.coordinator.get(key).await;
        self.metrics.record_request(started.elapsed());

        match result {
            Ok(item) => {
                self.metrics.record_hit();
                Ok(Some(item.value))
            }
            Err(CacheError::NotFound { .. }) => {
                self.metrics.record_miss();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a key; `ttl` of `None` never expires
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let item = CacheItem::new(key, value, ttl);
        let max_memory = self.config.max_memory;
        if max_memory > 0 && item.size > max_memory {
            return Err(CacheError::CapacityExceeded {
                size: item.size,
                max_memory,
            });
        }

        let started = Instant::now();
        let result = self.coordinator.put(item).await;
        self.metrics.record_request(started.elapsed());
        result.map(|_| ())
    }

    pub async fn delete(&self, key: &str) -> Result<DeleteOutcome> {
        let started = Instant::now();
        let result = self.coordinator.delete(key).await;
        self.metrics.record_request(started.elapsed());

        match result? {
            true => Ok(DeleteOutcome::Deleted),
            false => Ok(DeleteOutcome::NotFound),
        }
    }

    /// Join a node and migrate its share of keys onto it
    pub async fn add_node(&self, node: Node) -> Result<()> {
        if self.registry.contains(&node.id) {
            return Err(CacheError::DuplicateNode(node.id));
        }

        self.transport.connect(&node).await?;
        let node_id = node.id.clone();
        self.registry.register(node)?;
        self.health.watch(&node_id);
        self.refresh_node_count();

        info!(node = %node_id, nodes = self.registry.len(), "Node added");
        self.settle().await
    }

    /// Drain a node and retire it once its keys have moved
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.registry.begin_drain(node_id)?;
        self.refresh_node_count();

        info!(node = %node_id, "Node removal requested");
        self.settle().await
    }

    /// Drop a node from the ring now and re-replicate its keys in the
    /// background
    pub fn handle_node_failure(&self, node_id: &str) -> Result<()> {
        if !self.registry.contains(node_id) {
            return Err(CacheError::UnknownNode(node_id.to_string()));
        }
        self.registry.mark_dead(node_id);
        self.refresh_node_count();
        self.health.handle_node_failure(node_id);
        Ok(())
    }

    /// Run a rebalance now
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        self.rebalancer.rebalance().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.refresh_node_count();
        self.metrics.snapshot()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stop probing, reporting and pending rebalances
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Cache shutting down");
            self.shutdown.cancel();
        }
    }

    async fn settle(&self) -> Result<()> {
        match self.rebalancer.rebalance().await {
            Ok(report) => {
                if !report.is_clean() {
                    warn!(
                        failed = report.failed_keys.len(),
                        "Rebalance left keys behind, next trigger retries"
                    );
                }
                Ok(())
            }
            // the running pass re-runs for this change
            Err(CacheError::RebalanceInProgress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn refresh_node_count(&self) {
        self.metrics.set_node_count(self.registry.snapshot().len());
    }
}

impl Drop for DistributedCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Applies membership events to the registry
struct MembershipLoop {
    registry: Arc<NodeRegistry>,
    rebalancer: Arc<Rebalancer>,
    health: Arc<HealthMonitor>,
    metrics: Arc<CacheMetrics>,
    cancel: CancellationToken,
}

impl MembershipLoop {
    async fn run(self, mut events: UnboundedReceiver<MembershipEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            debug!(?event, "Membership event");

            match event {
                MembershipEvent::NodeFailed(node_id) => {
                    self.registry.mark_dead(&node_id);
                    self.spawn_rebalance();
                }
                MembershipEvent::NodeRecovered(node_id) => {
                    if self.registry.revive(&node_id) {
                        self.spawn_rebalance();
                    }
                }
                MembershipEvent::NodeRemoved(node_id) => {
                    self.health.unwatch(&node_id);
                }
            }
            self.metrics.set_node_count(self.registry.snapshot().len());
        }
        debug!("Membership loop stopped");
    }

    fn spawn_rebalance(&self) {
        let rebalancer = self.rebalancer.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = rebalancer.rebalance() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Rebalance trigger absorbed");
                    }
                }
            }
        });
    }
}
