//! Node Registry
//!
//! Tracks cluster membership and per-node liveness, and owns the hash ring.
//! Ring changes are applied copy-on-write: readers hold an `Arc` to a
//! complete ring and never see a half-applied membership change.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::node::{Node, NodeId};
use super::ring::HashRing;
use crate::error::{CacheError, Result};

/// Registry of cluster members
pub struct NodeRegistry {
    /// Writers hold this lock across the ring swap
    nodes: RwLock<HashMap<NodeId, Node>>,
    ring: RwLock<Arc<HashRing>>,
    connections: DashMap<NodeId, Arc<AtomicU32>>,
    epoch: AtomicU64,
}

impl NodeRegistry {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            ring: RwLock::new(Arc::new(HashRing::new(virtual_nodes))),
            connections: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current ring snapshot
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Incremented on every ring change
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Register a new node; eligible nodes join the ring immediately
    pub fn register(&self, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(CacheError::DuplicateNode(node.id));
        }

        info!(node = %node.id, address = %node.address, "Registering node");
        if node.is_eligible() {
            self.update_ring(|ring| ring.add_node(&node.id));
        }
        self.connections
            .insert(node.id.clone(), Arc::new(AtomicU32::new(0)));
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node from the registry and the ring
    pub fn deregister(&self, node_id: &str) -> Option<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes.remove(node_id)?;
        self.update_ring(|ring| ring.remove_node(node_id));
        self.connections.remove(node_id);
        info!(node = %node_id, "Removed node from registry");
        Some(node)
    }

    /// Exclude a node from placement while its data is migrated away
    pub fn begin_drain(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| CacheError::UnknownNode(node_id.to_string()))?;
        if !node.draining {
            info!(node = %node_id, "Draining node");
            node.draining = true;
            self.update_ring(|ring| ring.remove_node(node_id));
        }
        Ok(())
    }

    /// Mark a node dead and drop it from the ring, returns false if it was
    /// unknown or already dead
    pub fn mark_dead(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) if node.alive => {
                warn!(node = %node_id, "Marking node dead");
                node.mark_down();
                self.update_ring(|ring| ring.remove_node(node_id));
                true
            }
            _ => false,
        }
    }

    /// Bring a dead node back; it rejoins the ring unless draining
    pub fn revive(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) if !node.alive => {
                info!(node = %node_id, "Node recovered");
                node.mark_up();
                if !node.draining {
                    self.update_ring(|ring| ring.add_node(node_id));
                }
                true
            }
            _ => false,
        }
    }

    /// Record a successful probe
    pub fn record_probe(&self, node_id: &str, load_factor: Option<f64>) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            node.heartbeat(load_factor);
        }
    }

    /// Nodes eligible for new placements, in id order
    pub fn snapshot(&self) -> Vec<Node> {
        let mut eligible: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.is_eligible())
            .map(|n| self.with_connections(n.clone()))
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        eligible
    }

    /// Every registered node, in id order
    pub fn nodes(&self) -> Vec<Node> {
        let mut all: Vec<Node> = self
            .nodes
            .read()
            .values()
            .map(|n| self.with_connections(n.clone()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Nodes leaving the cluster (draining or dead)
    pub fn departed(&self) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| !n.is_eligible())
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .get(node_id)
            .map(|n| self.with_connections(n.clone()))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count an in-flight call to a node until the guard drops
    pub fn track_call(&self, node_id: &str) -> CallGuard {
        let counter = self
            .connections
            .get(node_id)
            .map(|c| c.value().clone());
        if let Some(c) = &counter {
            c.fetch_add(1, Ordering::Relaxed);
        }
        CallGuard { counter }
    }

    fn with_connections(&self, mut node: Node) -> Node {
        if let Some(c) = self.connections.get(&node.id) {
            node.active_connections = c.load(Ordering::Relaxed);
        }
        node
    }

    /// Copy-on-write ring update; callers hold the `nodes` write lock.
    fn update_ring(&self, change: impl FnOnce(&mut HashRing) -> bool) {
        let mut next = HashRing::clone(&self.ring.read());
        if change(&mut next) {
            *self.ring.write() = Arc::new(next);
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(epoch, nodes = self.ring.read().len(), "Ring updated");
        }
    }
}

/// Decrements a node's in-flight counter on drop
pub struct CallGuard {
    counter: Option<Arc<AtomicU32>>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(c) = &self.counter {
            c.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
