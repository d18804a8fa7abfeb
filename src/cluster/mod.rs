//! Cluster Module
//!
//! Placement, membership, failure detection, replication and rebalancing.

pub mod health;
pub mod node;
pub mod rebalancer;
pub mod registry;
pub mod replication;
pub mod ring;
pub mod transport;

pub use health::{HealthConfig, HealthMonitor, HealthState, MembershipEvent, NodeHealth};
pub use node::{Node, NodeId};
pub use rebalancer::{RebalanceReport, Rebalancer};
pub use registry::{CallGuard, NodeRegistry};
pub use replication::{ConsistencyLevel, ReplicationCoordinator, ReplicationStrategy};
pub use ring::{HashRing, VirtualNode, DEFAULT_VIRTUAL_NODES};
pub use transport::{LocalTransport, NodeTransport, ProbeReport};
