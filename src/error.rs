//! Error Types
//!
//! Every fallible cache operation returns [`CacheError`].

use thiserror::Error;

use crate::cluster::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key absent on every replica that answered
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("write quorum failed: {acks} of {required} acknowledgments")]
    WriteQuorumFailed { acks: usize, required: usize },

    #[error("read quorum failed: {responses} of {required} responses")]
    ReadQuorumFailed { responses: usize, required: usize },

    /// Transport-level failure talking to a single node
    #[error("node {node} unreachable: {reason}")]
    NodeUnreachable { node: NodeId, reason: String },

    /// Advisory: a rebalance pass is already running and will re-run
    #[error("rebalance already in progress")]
    RebalanceInProgress,

    #[error("capacity exceeded: item of {size} bytes does not fit in {max_memory} bytes")]
    CapacityExceeded { size: usize, max_memory: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),
}

impl CacheError {
    pub(crate) fn unreachable(node: &str, reason: impl Into<String>) -> Self {
        Self::NodeUnreachable {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from the transport rather than cache logic
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NodeUnreachable { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
