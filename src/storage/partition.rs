//! Partition ownership.
//!
//! Each partition has exactly one owner node. Scanners only ever iterate the
//! partitions their node owns, which bounds a pass to O(local entries) and
//! keeps nodes from coordinating with each other.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::{PartitionId, RoutingKey};

/// A member of the cluster that owns partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Static round-robin assignment of partitions to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    partition_count: usize,
    node_count: usize,
}

impl PartitionTable {
    /// Create a table. Zero counts are clamped to one.
    #[must_use]
    pub fn new(partition_count: usize, node_count: usize) -> Self {
        Self {
            partition_count: partition_count.max(1),
            node_count: node_count.max(1),
        }
    }

    #[must_use]
    pub const fn partition_count(&self) -> usize {
        self.partition_count
    }

    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.node_count
    }

    /// Partition a routing hint lands on.
    #[must_use]
    pub fn partition_of(&self, hint: RoutingKey) -> PartitionId {
        hint.partition(self.partition_count)
    }

    /// Node that owns `partition`.
    #[must_use]
    pub const fn owner(&self, partition: PartitionId) -> NodeId {
        NodeId(partition.0 % self.node_count)
    }

    /// All partitions owned by `node`, ascending.
    #[must_use]
    pub fn owned_by(&self, node: NodeId) -> Vec<PartitionId> {
        (0..self.partition_count)
            .map(PartitionId)
            .filter(|p| self.owner(*p) == node)
            .collect()
    }

    /// All nodes in the table.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        (0..self.node_count).map(NodeId)
    }
}
