//! Cluster event channel messages.
//!
//! Remote flow-mod requests and their results travel between cluster
//! nodes as [`ClusterEvent`]s, correlated by flow group id. Delivery is
//! at-least-once with arbitrary delay; duplicate results are resolved by
//! the relay (first result wins).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flow::group::FlowGroupId;
use crate::types::{FlowEntry, NodeId};

/// Direction of a relayed flow modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowModOp {
    /// Install the relayed entries.
    Add,
    /// Uninstall the relayed entries.
    Remove,
}

/// Request to apply flow entries on the switches a peer node owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowModRequest {
    /// Correlation key; one result event is expected per request.
    pub group: FlowGroupId,
    /// Node that issued the request and awaits the result.
    pub origin: NodeId,
    /// Install or uninstall.
    pub op: FlowModOp,
    /// Entries owned by the target node. For a bulk removal this carries
    /// every matched entry of that node across all flows being removed.
    pub entries: Vec<FlowEntry>,
}

/// Result of a relayed flow modification, posted back to the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowModResultEvent {
    /// Correlation key of the request this answers.
    pub group: FlowGroupId,
    /// Node that applied (or rejected) the entries.
    pub responder: NodeId,
    /// True iff every entry in the request was applied.
    pub success: bool,
}

/// Events carried on the cluster channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// Relay of a flow modification to the owning node.
    FlowModRequest(FlowModRequest),

    /// Result of a relayed flow modification.
    FlowModResult(FlowModResultEvent),

    /// A peer deregistered a flow group; the local registry entry (if
    /// any) is dropped without touching switches.
    FlowRemoved {
        tenant: String,
        group: FlowGroupId,
    },
}

impl ClusterEvent {
    /// The flow group this event concerns.
    pub fn group(&self) -> &FlowGroupId {
        match self {
            ClusterEvent::FlowModRequest(req) => &req.group,
            ClusterEvent::FlowModResult(res) => &res.group,
            ClusterEvent::FlowRemoved { group, .. } => group,
        }
    }

    /// Serialize for a wire-backed channel.
    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize from a wire-backed channel.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Asynchronous, at-least-once event channel between cluster nodes.
///
/// Implementations may delay or duplicate delivery; they must deliver
/// events for the same correlation key in post order.
#[async_trait]
pub trait ClusterEventChannel: Send + Sync {
    /// Post an event addressed to `target`.
    async fn post(&self, target: NodeId, event: ClusterEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowMatch;

    #[test]
    fn test_event_roundtrip() {
        let group = FlowGroupId::new("t", 42);
        let event = ClusterEvent::FlowModRequest(FlowModRequest {
            group: group.clone(),
            origin: 1,
            op: FlowModOp::Add,
            entries: vec![FlowEntry::new(2, 10, FlowMatch::in_port(1), vec![])],
        });

        let bytes = event.to_bytes().unwrap();
        let decoded = ClusterEvent::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.group(), &group);
        match decoded {
            ClusterEvent::FlowModRequest(req) => {
                assert_eq!(req.origin, 1);
                assert_eq!(req.op, FlowModOp::Add);
                assert_eq!(req.entries.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_group_accessor() {
        let group = FlowGroupId::new("t", 7);
        let event = ClusterEvent::FlowRemoved {
            tenant: "t".into(),
            group: group.clone(),
        };
        assert_eq!(event.group(), &group);
    }
}
