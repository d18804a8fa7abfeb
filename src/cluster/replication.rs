//! Replication Coordinator
//!
//! Executes reads and writes across a key's replica set according to the
//! configured consistency level and quorum sizes.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::node::NodeId;
use super::registry::NodeRegistry;
use super::transport::NodeTransport;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::storage::{CacheItem, Record};

/// Consistency level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Write quorum acks, read from a single replica
    Eventual,
    /// Every replica in the set for reads and writes
    Strong,
    /// Write quorum acks, read quorum responses
    Quorum,
}

impl Default for ConsistencyLevel {
    fn default() -> Self {
        Self::Quorum
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eventual" => Ok(Self::Eventual),
            "strong" => Ok(Self::Strong),
            "quorum" => Ok(Self::Quorum),
            other => Err(format!("unknown consistency level: {}", other)),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStrategy {
    /// Replicas per key (R)
    pub replication_factor: usize,
    pub consistency: ConsistencyLevel,
    /// Responses a quorum read waits for (Rq)
    pub read_quorum: usize,
    /// Acks a write waits for (Wq)
    pub write_quorum: usize,
}

impl Default for ReplicationStrategy {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            consistency: ConsistencyLevel::Quorum,
            read_quorum: 2,
            write_quorum: 2,
        }
    }
}

impl ReplicationStrategy {
    pub fn new(
        replication_factor: usize,
        consistency: ConsistencyLevel,
        read_quorum: usize,
        write_quorum: usize,
    ) -> Self {
        Self {
            replication_factor,
            consistency,
            read_quorum,
            write_quorum,
        }
    }

    /// Enforce `1 <= Rq, Wq <= R`
    pub fn validate(&self) -> Result<()> {
        let r = self.replication_factor;
        if r == 0 {
            return Err(CacheError::InvalidConfig(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.write_quorum == 0 || self.write_quorum > r {
            return Err(CacheError::InvalidConfig(format!(
                "write_quorum {} outside 1..={}",
                self.write_quorum, r
            )));
        }
        if self.read_quorum == 0 || self.read_quorum > r {
            return Err(CacheError::InvalidConfig(format!(
                "read_quorum {} outside 1..={}",
                self.read_quorum, r
            )));
        }
        if self.consistency == ConsistencyLevel::Quorum && self.read_quorum + self.write_quorum <= r
        {
            warn!(
                r,
                rq = self.read_quorum,
                wq = self.write_quorum,
                "Read and write quorums do not overlap; reads may miss recent writes"
            );
        }
        Ok(())
    }

    /// Acks a write needs from a replica set of `replicas` nodes. A set
    /// smaller than the write quorum cannot satisfy it.
    pub fn write_acks(&self, replicas: usize) -> usize {
        match self.consistency {
            ConsistencyLevel::Strong => replicas,
            _ => self.write_quorum,
        }
    }

    /// Responses a read needs from a replica set of `replicas` nodes
    pub fn read_responses(&self, replicas: usize) -> usize {
        match self.consistency {
            ConsistencyLevel::Eventual => 1,
            ConsistencyLevel::Quorum => self.read_quorum,
            ConsistencyLevel::Strong => replicas,
        }
    }
}

/// Run a replica call under a deadline; an elapsed deadline reads as the
/// node being unreachable.
pub(crate) async fn bounded<T>(
    node_id: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::unreachable(
            node_id,
            format!("timed out after {:?}", limit),
        )),
    }
}

type ReplicaCall<T> = BoxFuture<'static, (NodeId, Result<T>)>;

/// Quorum reads and writes over the current ring
pub struct ReplicationCoordinator {
    strategy: ReplicationStrategy,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    metrics: Arc<CacheMetrics>,
    call_timeout: Duration,
    write_retries: usize,
}

impl ReplicationCoordinator {
    pub fn new(
        config: &CacheConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            strategy: config.replication.clone(),
            registry,
            transport,
            metrics,
            call_timeout: config.probe_timeout,
            write_retries: config.write_retries,
        }
    }

    pub fn strategy(&self) -> &ReplicationStrategy {
        &self.strategy
    }

    fn replicas(&self, key: &str) -> Vec<NodeId> {
        self.registry
            .ring()
            .replicas_for(key, self.strategy.replication_factor)
    }

    /// Write an item to its replicas, returns the acks received before
    /// returning. Stragglers finish in the background.
    pub async fn put(&self, item: CacheItem) -> Result<usize> {
        let replicas = self.replicas(&item.key);
        if replicas.is_empty() {
            return Err(CacheError::WriteQuorumFailed {
                acks: 0,
                required: self.strategy.write_quorum,
            });
        }
        let required = self.strategy.write_acks(replicas.len());
        if replicas.len() < required {
            warn!(key = %item.key, replicas = replicas.len(), required, "Too few replicas for write quorum");
            return Err(CacheError::WriteQuorumFailed { acks: 0, required });
        }

        let started = Instant::now();
        let mut pending: FuturesUnordered<ReplicaCall<bool>> = replicas
            .iter()
            .map(|node_id| self.put_call(node_id.clone(), item.clone()))
            .collect();

        let mut acks = 0;
        let mut attempts: HashMap<NodeId, usize> = HashMap::new();
        let mut refusal = None;

        while let Some((node_id, result)) = pending.next().await {
            match result {
                Ok(_) => {
                    acks += 1;
                    if acks >= required {
                        break;
                    }
                }
                Err(e) => {
                    debug!(node = %node_id, key = %item.key, error = %e, "Replica write failed");
                    if !e.is_transport() {
                        refusal = Some(e);
                        continue;
                    }
                    let tried = attempts.entry(node_id.clone()).or_insert(0);
                    if *tried < self.write_retries {
                        *tried += 1;
                        pending.push(self.put_call(node_id, item.clone()));
                    }
                }
            }
        }

        if acks < required {
            warn!(key = %item.key, acks, required, "Write quorum failed");
            if acks == 0 {
                if let Some(e) = refusal {
                    return Err(e);
                }
            }
            return Err(CacheError::WriteQuorumFailed { acks, required });
        }

        if pending.is_empty() {
            self.metrics.set_replication_lag(Duration::ZERO);
        } else {
            let metrics = self.metrics.clone();
            let key = item.key.clone();
            tokio::spawn(async move {
                let quorum_at = Instant::now();
                while let Some((node_id, result)) = pending.next().await {
                    if let Err(e) = result {
                        debug!(node = %node_id, key = %key, error = %e, "Straggler write failed");
                    }
                }
                metrics.set_replication_lag(quorum_at.elapsed());
            });
        }

        debug!(key = %item.key, acks, elapsed = ?started.elapsed(), "Write acknowledged");
        Ok(acks)
    }

    /// Read a key, resolving disagreeing replicas by last write
    pub async fn get(&self, key: &str) -> Result<CacheItem> {
        let replicas = self.replicas(key);
        if replicas.is_empty() {
            return Err(CacheError::ReadQuorumFailed {
                responses: 0,
                required: self.strategy.read_responses(self.strategy.replication_factor),
            });
        }

        let required = self.strategy.read_responses(replicas.len());
        if replicas.len() < required {
            warn!(key, replicas = replicas.len(), required, "Too few replicas for read quorum");
            return Err(CacheError::ReadQuorumFailed {
                responses: 0,
                required,
            });
        }

        match self.strategy.consistency {
            ConsistencyLevel::Eventual => self.get_any(key, &replicas).await,
            _ => self.get_quorum(key, replicas, required).await,
        }
    }

    /// First replica that answers, in ring order
    async fn get_any(&self, key: &str, replicas: &[NodeId]) -> Result<CacheItem> {
        for node_id in replicas {
            let (_, result) = self.get_call(node_id.clone(), key.to_string()).await;
            match result {
                Ok(Some(Record::Live(item))) => return Ok(item),
                Ok(_) => {
                    return Err(CacheError::NotFound {
                        key: key.to_string(),
                    })
                }
                Err(e) => {
                    debug!(node = %node_id, key, error = %e, "Replica read failed, trying next");
                }
            }
        }
        Err(CacheError::ReadQuorumFailed {
            responses: 0,
            required: 1,
        })
    }

    async fn get_quorum(
        &self,
        key: &str,
        replicas: Vec<NodeId>,
        required: usize,
    ) -> Result<CacheItem> {
        let mut pending: FuturesUnordered<ReplicaCall<Option<Record>>> = replicas
            .into_iter()
            .map(|node_id| self.get_call(node_id, key.to_string()))
            .collect();

        let mut responses: Vec<(NodeId, Option<Record>)> = Vec::with_capacity(required);
        while let Some((node_id, result)) = pending.next().await {
            match result {
                Ok(found) => {
                    responses.push((node_id, found));
                    if responses.len() >= required {
                        break;
                    }
                }
                Err(e) => {
                    debug!(node = %node_id, key, error = %e, "Replica read failed");
                }
            }
        }
        // outstanding calls are cancelled here
        drop(pending);

        if responses.len() < required {
            warn!(key, responses = responses.len(), required, "Read quorum failed");
            return Err(CacheError::ReadQuorumFailed {
                responses: responses.len(),
                required,
            });
        }

        let not_found = || CacheError::NotFound {
            key: key.to_string(),
        };
        let freshest = responses
            .iter()
            .filter_map(|(_, found)| found.as_ref())
            .max_by_key(|record| record.rank())
            .cloned()
            .ok_or_else(not_found)?;

        // a replica with nothing only needs repair when the key is live
        let stale: Vec<NodeId> = responses
            .into_iter()
            .filter(|(_, found)| match found {
                Some(record) => freshest.newer_than(record),
                None => freshest.is_live(),
            })
            .map(|(node_id, _)| node_id)
            .collect();
        if !stale.is_empty() {
            self.repair(freshest.clone(), stale);
        }

        freshest.into_item().ok_or_else(not_found)
    }

    /// Bring replicas that answered with an older version, or nothing, up to
    /// the freshest one, whether that is a value or a delete
    fn repair(&self, record: Record, nodes: Vec<NodeId>) {
        debug!(key = %record.key(), live = record.is_live(), nodes = ?nodes, "Read repair");
        let calls: FuturesUnordered<ReplicaCall<bool>> = nodes
            .into_iter()
            .map(|node_id| self.apply_call(node_id, record.clone()))
            .collect();
        tokio::spawn(async move {
            calls
                .for_each(|(node_id, result)| async move {
                    if let Err(e) = result {
                        debug!(node = %node_id, error = %e, "Read repair failed");
                    }
                })
                .await;
        });
    }

    /// Remove a key from every replica, best effort. Returns whether any
    /// replica held it.
    ///
    /// Every replica records the same delete time, so copies on replicas
    /// this call missed lose to it in later reads and rebalances.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let replicas = self.replicas(key);
        let deleted_at = Utc::now();
        let mut pending: FuturesUnordered<ReplicaCall<bool>> = replicas
            .into_iter()
            .map(|node_id| self.delete_call(node_id, key.to_string(), deleted_at))
            .collect();

        let mut responses = 0;
        let mut deleted = false;
        while let Some((node_id, result)) = pending.next().await {
            match result {
                Ok(held) => {
                    responses += 1;
                    deleted |= held;
                }
                Err(e) => {
                    warn!(node = %node_id, key, error = %e, "Replica delete failed");
                }
            }
        }

        if responses == 0 {
            return Err(CacheError::WriteQuorumFailed {
                acks: 0,
                required: 1,
            });
        }
        Ok(deleted)
    }

    fn put_call(&self, node_id: NodeId, item: CacheItem) -> ReplicaCall<bool> {
        let transport = self.transport.clone();
        self.call(node_id, move |node_id| async move {
            transport.put(&node_id, item).await
        })
    }

    fn get_call(&self, node_id: NodeId, key: String) -> ReplicaCall<Option<Record>> {
        let transport = self.transport.clone();
        self.call(node_id, move |node_id| async move {
            transport.get(&node_id, &key).await
        })
    }

    fn delete_call(
        &self,
        node_id: NodeId,
        key: String,
        deleted_at: DateTime<Utc>,
    ) -> ReplicaCall<bool> {
        let transport = self.transport.clone();
        self.call(node_id, move |node_id| async move {
            transport.delete(&node_id, &key, deleted_at).await
        })
    }

    fn apply_call(&self, node_id: NodeId, record: Record) -> ReplicaCall<bool> {
        match record {
            Record::Live(item) => self.put_call(node_id, item),
            Record::Deleted(tombstone) => {
                self.delete_call(node_id, tombstone.key, tombstone.deleted_at)
            }
        }
    }

    /// Wrap one replica call with its deadline, connection tracking and
    /// error accounting
    fn call<T, F, Fut>(&self, node_id: NodeId, op: F) -> ReplicaCall<T>
    where
        T: Send + 'static,
        F: FnOnce(NodeId) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let limit = self.call_timeout;
        async move {
            let _guard = registry.track_call(&node_id);
            let result = bounded(&node_id, limit, op(node_id.clone())).await;
            if matches!(&result, Err(e) if e.is_transport()) {
                metrics.record_network_error();
            }
            (node_id, result)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::Node;
    use crate::cluster::transport::LocalTransport;
    use tokio_test::{assert_err, assert_ok};

    struct Cluster {
        coordinator: ReplicationCoordinator,
        transport: Arc<LocalTransport>,
        registry: Arc<NodeRegistry>,
        metrics: Arc<CacheMetrics>,
    }

    async fn cluster(config: CacheConfig, nodes: &[&str]) -> Cluster {
        let metrics = Arc::new(CacheMetrics::new());
        let registry = Arc::new(NodeRegistry::new(config.virtual_nodes));
        let transport = Arc::new(LocalTransport::from_config(&config, metrics.clone()));
        for id in nodes {
            let node = Node::new(*id, "local");
            transport.connect(&node).await.unwrap();
            registry.register(node).unwrap();
        }
        let coordinator =
            ReplicationCoordinator::new(&config, registry.clone(), transport.clone(), metrics.clone());
        Cluster {
            coordinator,
            transport,
            registry,
            metrics,
        }
    }

    fn holders(cluster: &Cluster, key: &str) -> usize {
        cluster
            .registry
            .nodes()
            .iter()
            .filter_map(|n| cluster.transport.store(&n.id))
            .filter(|s| s.peek(key).is_some())
            .count()
    }

    #[test]
    fn test_validate_bounds() {
        assert_ok!(ReplicationStrategy::default().validate());
        assert_err!(ReplicationStrategy::new(3, ConsistencyLevel::Quorum, 4, 2).validate());
        assert_err!(ReplicationStrategy::new(3, ConsistencyLevel::Quorum, 2, 0).validate());
        assert_err!(ReplicationStrategy::new(0, ConsistencyLevel::Eventual, 1, 1).validate());
    }

    #[test]
    fn test_effective_quorums() {
        let quorum = ReplicationStrategy::default();
        assert_eq!(quorum.write_acks(3), 2);
        assert_eq!(quorum.read_responses(3), 2);
        // a smaller replica set still owes the configured quorum
        assert_eq!(quorum.write_acks(1), 2);
        assert_eq!(quorum.read_responses(1), 2);

        let strong = ReplicationStrategy::new(3, ConsistencyLevel::Strong, 1, 1);
        assert_eq!(strong.write_acks(3), 3);
        assert_eq!(strong.read_responses(2), 2);

        let eventual = ReplicationStrategy::new(3, ConsistencyLevel::Eventual, 2, 1);
        assert_eq!(eventual.write_acks(3), 1);
        assert_eq!(eventual.read_responses(3), 1);
    }

    #[test]
    fn test_parse_consistency() {
        assert_eq!("STRONG".parse::<ConsistencyLevel>(), Ok(ConsistencyLevel::Strong));
        assert!("linear".parse::<ConsistencyLevel>().is_err());
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3", "n4"]).await;
        let acks = c
            .coordinator
            .put(CacheItem::new("user:1", &b"alice"[..], None))
            .await
            .unwrap();
        assert!(acks >= 2);

        let item = c.coordinator.get("user:1").await.unwrap();
        assert_eq!(item.value.as_ref(), b"alice");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(holders(&c, "user:1"), 3);
    }

    #[tokio::test]
    async fn test_quorum_with_one_unreachable_replica() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.transport.set_reachable("n2", false);

        let acks = c
            .coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        assert_eq!(acks, 2);
        assert_eq!(c.coordinator.get("k").await.unwrap().value.as_ref(), b"v");

        // the replica that missed the write answers, one that has it does not
        c.transport.set_reachable("n2", true);
        c.transport.set_reachable("n1", false);
        assert_eq!(c.coordinator.get("k").await.unwrap().value.as_ref(), b"v");
    }

    #[tokio::test]
    async fn test_write_quorum_failure() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.transport.set_reachable("n1", false);
        c.transport.set_reachable("n2", false);

        let err = c
            .coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::WriteQuorumFailed { acks: 1, required: 2 });
        // two failed replicas, each retried once
        assert_eq!(c.metrics.network_errors(), 4);

        let err = c.coordinator.get("k").await.unwrap_err();
        assert_eq!(
            err,
            CacheError::ReadQuorumFailed {
                responses: 1,
                required: 2
            }
        );
        // partial writes stay in place
        assert_eq!(holders(&c, "k"), 1);
    }

    #[tokio::test]
    async fn test_strong_needs_every_replica() {
        let config = CacheConfig::default().with_consistency(ConsistencyLevel::Strong);
        let c = cluster(config, &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();

        c.transport.set_reachable("n3", false);
        let err = c
            .coordinator
            .put(CacheItem::new("k", &b"w"[..], None))
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::WriteQuorumFailed { acks: 2, required: 3 });
        assert!(matches!(
            c.coordinator.get("k").await,
            Err(CacheError::ReadQuorumFailed { responses: 2, required: 3 })
        ));
    }

    #[tokio::test]
    async fn test_eventual_reads_fall_through() {
        let config = CacheConfig::default().with_replication(ReplicationStrategy::new(
            3,
            ConsistencyLevel::Eventual,
            1,
            3,
        ));
        let c = cluster(config, &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();

        let primary = c.registry.ring().primary_for("k").unwrap();
        c.transport.set_reachable(&primary, false);
        assert_eq!(c.coordinator.get("k").await.unwrap().value.as_ref(), b"v");

        for id in ["n1", "n2", "n3"] {
            c.transport.set_reachable(id, false);
        }
        assert!(matches!(
            c.coordinator.get("k").await,
            Err(CacheError::ReadQuorumFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_last_write_wins_and_read_repair() {
        let config = CacheConfig::default().with_consistency(ConsistencyLevel::Strong);
        let c = cluster(config, &["n1", "n2", "n3"]).await;
        let old = chrono::Utc::now() - chrono::Duration::seconds(10);

        // n1 holds an older version, n2 the newest, n3 nothing
        c.transport
            .store("n1")
            .unwrap()
            .put(CacheItem::new("k", &b"old"[..], None).with_created_at(old))
            .unwrap();
        c.transport
            .store("n2")
            .unwrap()
            .put(CacheItem::new("k", &b"new"[..], None))
            .unwrap();

        let item = c.coordinator.get("k").await.unwrap();
        assert_eq!(item.value.as_ref(), b"new");

        tokio::time::sleep(Duration::from_millis(50)).await;
        for id in ["n1", "n2", "n3"] {
            let repaired = c.transport.store(id).unwrap().peek("k").unwrap();
            assert_eq!(repaired.value.as_ref(), b"new");
        }
    }

    #[tokio::test]
    async fn test_missing_key() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        assert_eq!(
            c.coordinator.get("nope").await.unwrap_err(),
            CacheError::NotFound { key: "nope".into() }
        );
    }

    #[tokio::test]
    async fn test_delete_best_effort() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        c.transport.set_reachable("n3", false);
        assert!(c.coordinator.delete("k").await.unwrap());
        assert!(!c.coordinator.delete("k").await.unwrap());

        for id in ["n1", "n2"] {
            c.transport.set_reachable(id, false);
        }
        assert_eq!(
            c.coordinator.delete("k").await.unwrap_err(),
            CacheError::WriteQuorumFailed { acks: 0, required: 1 }
        );
    }

    #[tokio::test]
    async fn test_ring_smaller_than_quorum() {
        let c = cluster(CacheConfig::default(), &["n1"]).await;
        assert_eq!(
            c.coordinator
                .put(CacheItem::new("k", &b"v"[..], None))
                .await
                .unwrap_err(),
            CacheError::WriteQuorumFailed { acks: 0, required: 2 }
        );
        assert_eq!(holders(&c, "k"), 0);
        assert_eq!(
            c.coordinator.get("k").await.unwrap_err(),
            CacheError::ReadQuorumFailed {
                responses: 0,
                required: 2
            }
        );

        // strong consistency asks for every replica the ring has
        let config = CacheConfig::default().with_consistency(ConsistencyLevel::Strong);
        let c = cluster(config, &["n1"]).await;
        assert_eq!(
            c.coordinator
                .put(CacheItem::new("k", &b"v"[..], None))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_missed_delete_is_not_read_back() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(holders(&c, "k"), 3);

        c.transport.set_reachable("n3", false);
        assert!(c.coordinator.delete("k").await.unwrap());
        c.transport.set_reachable("n3", true);

        // the quorum is n2, which saw the delete, and n3, which did not
        c.transport.set_reachable("n1", false);
        assert_eq!(
            c.coordinator.get("k").await.unwrap_err(),
            CacheError::NotFound { key: "k".into() }
        );

        // read repair carries the delete to n3 instead of the value to n2
        tokio::time::sleep(Duration::from_millis(50)).await;
        for id in ["n2", "n3"] {
            let record = c.transport.store(id).unwrap().read("k");
            assert!(matches!(record, Some(Record::Deleted(_))), "{}: {:?}", id, record);
        }

        c.transport.set_reachable("n1", true);
        assert!(!c.coordinator.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_after_delete_wins() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.coordinator.delete("k").await.unwrap();

        c.coordinator
            .put(CacheItem::new("k", &b"again"[..], None))
            .await
            .unwrap();
        assert_eq!(c.coordinator.get("k").await.unwrap().value.as_ref(), b"again");
    }

    #[tokio::test]
    async fn test_empty_ring() {
        let c = cluster(CacheConfig::default(), &[]).await;
        assert!(matches!(
            c.coordinator.put(CacheItem::new("k", &b"v"[..], None)).await,
            Err(CacheError::WriteQuorumFailed { acks: 0, .. })
        ));
        assert!(matches!(
            c.coordinator.get("k").await,
            Err(CacheError::ReadQuorumFailed { responses: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_replica_times_out_and_lags() {
        let config = CacheConfig::default().with_probe_timeout(Duration::from_millis(200));
        let c = cluster(config, &["n1", "n2", "n3"]).await;
        c.transport.set_latency("n1", Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(c.coordinator.get("k").await.unwrap().value.as_ref(), b"v");

        // the straggler gives up at the call timeout
        tokio::time::sleep(Duration::from_secs(1)).await;
        let lag = c.metrics.snapshot().replication_lag;
        assert!(lag >= Duration::from_millis(200), "{:?}", lag);
        assert!(lag < Duration::from_secs(1), "{:?}", lag);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_cancels_only_its_operation() {
        let c = cluster(CacheConfig::default(), &["n1", "n2", "n3"]).await;
        c.coordinator
            .put(CacheItem::new("k", &b"v"[..], None))
            .await
            .unwrap();
        for id in ["n1", "n2", "n3"] {
            c.transport.set_latency(id, Duration::from_millis(500));
        }

        let (short, full) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(100), c.coordinator.get("k")),
            c.coordinator.get("k"),
        );
        assert!(short.is_err());
        assert_eq!(full.unwrap().value.as_ref(), b"v");
    }
}
