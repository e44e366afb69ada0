//! In-memory cluster event bus.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cluster::events::{ClusterEvent, ClusterEventChannel};
use crate::error::Result;
use crate::service::FlowService;
use crate::types::NodeId;

/// Routes events between in-process [`FlowService`]s.
///
/// Models the real channel's failure modes: delivery is asynchronous (a
/// spawned task per event), a node can be black-holed (posts accepted
/// but never delivered, like a peer that never answers), and duplicate mode
/// delivers every event twice to exercise at-least-once semantics.
#[derive(Default)]
pub struct TestBus {
    nodes: DashMap<NodeId, Arc<FlowService>>,
    black_holes: DashSet<NodeId>,
    duplicate: AtomicBool,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a service as the listener for `node`.
    pub fn register(&self, node: NodeId, service: Arc<FlowService>) {
        self.nodes.insert(node, service);
    }

    /// Accept but never deliver events addressed to `node`.
    pub fn black_hole(&self, node: NodeId) {
        self.black_holes.insert(node);
    }

    /// Deliver every subsequent event twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterEventChannel for TestBus {
    async fn post(&self, target: NodeId, event: ClusterEvent) -> Result<()> {
        if self.black_holes.contains(&target) {
            tracing::debug!(target, "test bus black-holing event");
            return Ok(());
        }
        let Some(service) = self.nodes.get(&target).map(|s| Arc::clone(&s)) else {
            // An unknown target behaves like a peer that never answers.
            return Ok(());
        };

        let duplicate = self.duplicate.load(Ordering::SeqCst);
        tokio::spawn(async move {
            service.handle_event(event.clone()).await;
            if duplicate {
                service.handle_event(event).await;
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for TestBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestBus")
            .field("nodes", &self.nodes.len())
            .field("black_holes", &self.black_holes.len())
            .finish()
    }
}
