//! Remote flow-mod relay.
//!
//! Posts [`FlowModRequest`]s to the nodes owning remote entries and parks
//! a completion slot per correlation key until the matching
//! [`FlowModResultEvent`] arrives. The channel is at-least-once, so a
//! result may be delivered more than once; the first one wins and
//! later duplicates are logged and dropped.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::cluster::events::{
    ClusterEvent, ClusterEventChannel, FlowModOp, FlowModRequest, FlowModResultEvent,
};
use crate::error::{Error, Result};
use crate::flow::group::FlowGroupId;
use crate::types::{FlowEntry, NodeId};

/// Correlation key: one pending slot per (group, responder) pair.
type PendingKey = (FlowGroupId, NodeId);

/// Relays flow modifications to peer nodes and resolves their results.
pub struct FlowRelay {
    /// This node's id, stamped as the origin of every request.
    node_id: NodeId,

    /// Channel the requests travel on.
    channel: Arc<dyn ClusterEventChannel>,

    /// Pending relayed requests awaiting a result event.
    pending: DashMap<PendingKey, oneshot::Sender<FlowModResultEvent>>,
}

impl FlowRelay {
    pub fn new(node_id: NodeId, channel: Arc<dyn ClusterEventChannel>) -> Self {
        Self {
            node_id,
            channel,
            pending: DashMap::new(),
        }
    }

    /// Number of relays still awaiting a result.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Post one relay request to `target` and return the completion slot.
    ///
    /// The caller bounds the wait on the receiver with the remote (or
    /// bulk) timeout; the relay itself never times out a pending slot.
    pub async fn request(
        &self,
        target: NodeId,
        group: FlowGroupId,
        op: FlowModOp,
        entries: Vec<FlowEntry>,
    ) -> Result<oneshot::Receiver<FlowModResultEvent>> {
        let key = (group.clone(), target);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let request = FlowModRequest {
            group: group.clone(),
            origin: self.node_id,
            op,
            entries,
        };

        tracing::debug!(
            node_id = self.node_id,
            target,
            group = %group,
            ?op,
            "relaying flow modification to owning node"
        );

        if let Err(e) = self
            .channel
            .post(target, ClusterEvent::FlowModRequest(request))
            .await
        {
            self.pending.remove(&key);
            return Err(Error::ChannelPost {
                node: target,
                reason: e.to_string(),
            });
        }

        Ok(rx)
    }

    /// Announce a deregistered group to `peers` so their registries
    /// converge. Fire-and-forget: a peer that misses the announcement
    /// only keeps a stale registry row, never a stale switch entry.
    pub async fn announce_removed(&self, peers: &[NodeId], tenant: &str, group: FlowGroupId) {
        for &peer in peers {
            if peer == self.node_id {
                continue;
            }
            let event = ClusterEvent::FlowRemoved {
                tenant: tenant.to_string(),
                group: group.clone(),
            };
            if let Err(e) = self.channel.post(peer, event).await {
                tracing::warn!(
                    node_id = self.node_id,
                    peer,
                    group = %group,
                    error = %e,
                    "failed to announce flow removal to peer"
                );
            }
        }
    }

    /// Resolve an incoming result event against its pending slot.
    ///
    /// Unknown or duplicate results are dropped; a slot whose waiter has
    /// already given up is ignored the same way.
    pub fn handle_result(&self, result: FlowModResultEvent) {
        let key = (result.group.clone(), result.responder);
        match self.pending.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::warn!(
                    node_id = self.node_id,
                    group = %result.group,
                    responder = result.responder,
                    "dropping duplicate or unknown flow-mod result"
                );
            }
        }
    }

    /// Drop every pending slot, waking waiters with a closed channel.
    pub fn abort_pending(&self) {
        self.pending.clear();
    }
}

impl std::fmt::Debug for FlowRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRelay")
            .field("node_id", &self.node_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Channel that records posts and optionally rejects them.
    struct RecordingChannel {
        posts: Mutex<Vec<(NodeId, ClusterEvent)>>,
        fail: bool,
    }

    impl RecordingChannel {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                posts: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                posts: Mutex::new(Vec::new()),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl ClusterEventChannel for RecordingChannel {
        async fn post(&self, target: NodeId, event: ClusterEvent) -> Result<()> {
            if self.fail {
                return Err(Error::Internal("bus down".into()));
            }
            self.posts.lock().push((target, event));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_resolves_on_result() {
        let channel = RecordingChannel::ok();
        let relay = FlowRelay::new(1, channel.clone());
        let group = FlowGroupId::new("t", 1);

        let rx = relay
            .request(2, group.clone(), FlowModOp::Add, vec![])
            .await
            .unwrap();
        assert_eq!(relay.pending_count(), 1);
        assert_eq!(channel.posts.lock().len(), 1);

        relay.handle_result(FlowModResultEvent {
            group: group.clone(),
            responder: 2,
            success: true,
        });

        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_result_is_dropped() {
        let channel = RecordingChannel::ok();
        let relay = FlowRelay::new(1, channel);
        let group = FlowGroupId::new("t", 2);

        let rx = relay
            .request(2, group.clone(), FlowModOp::Add, vec![])
            .await
            .unwrap();

        let event = FlowModResultEvent {
            group,
            responder: 2,
            success: false,
        };
        relay.handle_result(event.clone());
        // At-least-once delivery: the second copy must be a no-op.
        relay.handle_result(event);

        assert!(!rx.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_post_failure_cleans_pending_slot() {
        let channel = RecordingChannel::failing();
        let relay = FlowRelay::new(1, channel);

        let err = relay
            .request(2, FlowGroupId::new("t", 3), FlowModOp::Remove, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelPost { node: 2, .. }));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_pending_closes_waiters() {
        let channel = RecordingChannel::ok();
        let relay = FlowRelay::new(1, channel);

        let rx = relay
            .request(2, FlowGroupId::new("t", 4), FlowModOp::Add, vec![])
            .await
            .unwrap();
        relay.abort_pending();
        assert!(rx.await.is_err());
    }
}
