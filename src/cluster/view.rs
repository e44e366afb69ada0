//! Cluster membership view.
//!
//! Membership is a consumed capability: some discovery layer keeps the
//! member set current, and a flow-mod task queries it exactly once, at
//! submission, to classify entry locality. The snapshot is deliberately
//! not refreshed during the task's wait; a peer that leaves mid-task
//! surfaces through the remote timeout, not through re-classification.

use parking_lot::RwLock;
use std::collections::HashSet;

use crate::types::{Locality, NodeId};

/// Live view of cluster membership.
#[derive(Debug)]
pub struct ClusterView {
    local: NodeId,
    members: RwLock<HashSet<NodeId>>,
}

impl ClusterView {
    /// Create a view with the local node as the only member.
    pub fn new(local: NodeId) -> Self {
        let mut members = HashSet::new();
        members.insert(local);
        Self {
            local,
            members: RwLock::new(members),
        }
    }

    /// The local node's id.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Record a node joining the cluster.
    pub fn add_member(&self, node: NodeId) {
        self.members.write().insert(node);
    }

    /// Record a node leaving the cluster.
    pub fn remove_member(&self, node: NodeId) {
        self.members.write().remove(&node);
    }

    /// Whether a node is currently a member.
    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.read().contains(&node)
    }

    /// Number of current members.
    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Current member ids, local node included.
    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().iter().copied().collect()
    }

    /// Capture the membership as of now. One snapshot per task.
    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            local: self.local,
            members: self.members.read().clone(),
        }
    }
}

/// Immutable membership capture used for locality classification.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    local: NodeId,
    members: HashSet<NodeId>,
}

impl MembershipSnapshot {
    /// The local node's id.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Classify a flow entry's owning node relative to the local node.
    pub fn classify(&self, node: NodeId) -> Locality {
        if node == self.local {
            Locality::Local
        } else if self.members.contains(&node) {
            Locality::Remote
        } else {
            Locality::Disconnected
        }
    }
}
