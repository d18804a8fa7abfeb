//! Cluster Node
//!
//! Represents a node in the cache cluster.

use chrono::{DateTime, Utc};

/// Unique node identifier
pub type NodeId = String;

/// Cluster node information
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique node ID
    pub id: NodeId,
    /// Address the transport uses to reach the node
    pub address: String,
    /// Liveness as judged by the health monitor
    pub alive: bool,
    /// Leaving the cluster; excluded from placement while data migrates
    pub draining: bool,
    /// Last successful probe
    pub last_seen: Option<DateTime<Utc>>,
    /// Fraction of the node's memory budget in use
    pub load_factor: f64,
    /// In-flight replica calls
    pub active_connections: u32,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            alive: true,
            draining: false,
            last_seen: None,
            load_factor: 0.0,
            active_connections: 0,
        }
    }

    /// Check if node may receive new placements
    pub fn is_eligible(&self) -> bool {
        self.alive && !self.draining
    }

    /// Record a successful probe
    pub fn heartbeat(&mut self, load_factor: Option<f64>) {
        self.last_seen = Some(Utc::now());
        if let Some(load) = load_factor {
            self.load_factor = load;
        }
    }

    /// Mark node as down
    pub fn mark_down(&mut self) {
        self.alive = false;
    }

    /// Mark node as answering again
    pub fn mark_up(&mut self) {
        self.alive = true;
    }
}
