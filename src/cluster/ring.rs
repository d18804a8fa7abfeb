//! Hash Ring
//!
//! Consistent hashing with virtual nodes. Each physical node owns
//! `virtual_nodes` positions on a 32-bit ring; a key belongs to the first
//! positions clockwise from its hash.

use std::collections::BTreeSet;

use super::node::NodeId;

/// Default number of positions per physical node
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Ring position of one virtual node.
///
/// Ordered by hash, then node id, so equal hashes sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualNode {
    pub hash: u32,
    pub node_id: NodeId,
}

/// Hash a key onto the ring
pub fn hash_key(key: &[u8]) -> u32 {
    fmix32(crc32fast::hash(key))
}

/// Murmur3 finalizer. CRC32 is linear, so labels differing only in a
/// trailing index land close together without it.
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Consistent hash ring
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    /// Sorted by (hash, node_id)
    positions: Vec<VirtualNode>,
    nodes: BTreeSet<NodeId>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: Vec::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Add a node's virtual positions, returns false if already present
    pub fn add_node(&mut self, node_id: &str) -> bool {
        if !self.nodes.insert(node_id.to_string()) {
            return false;
        }

        self.positions.reserve(self.virtual_nodes);
        for index in 0..self.virtual_nodes {
            let label = format!("{}#{}", node_id, index);
            self.positions.push(VirtualNode {
                hash: hash_key(label.as_bytes()),
                node_id: node_id.to_string(),
            });
        }
        self.positions.sort_unstable();
        true
    }

    /// Remove a node's virtual positions, returns false if absent
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if !self.nodes.remove(node_id) {
            return false;
        }
        self.positions.retain(|v| v.node_id != node_id);
        true
    }

    /// Up to `count` distinct physical nodes for a key, primary first
    pub fn replicas_for(&self, key: &str, count: usize) -> Vec<NodeId> {
        let wanted = count.min(self.nodes.len());
        let mut replicas: Vec<NodeId> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return replicas;
        }

        let hash = hash_key(key.as_bytes());
        let start = self.positions.partition_point(|v| v.hash < hash);
        let len = self.positions.len();

        for offset in 0..len {
            let vnode = &self.positions[(start + offset) % len];
            if !replicas.contains(&vnode.node_id) {
                replicas.push(vnode.node_id.clone());
                if replicas.len() == wanted {
                    break;
                }
            }
        }
        replicas
    }

    /// Owner of the first replica
    pub fn primary_for(&self, key: &str) -> Option<NodeId> {
        self.replicas_for(key, 1).into_iter().next()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Physical nodes in id order
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    /// Number of physical nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Total ring positions
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}
