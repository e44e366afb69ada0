//! Testing utilities for the flow-commit protocol.
//!
//! Provides an in-memory cluster harness: a multi-node event bus with
//! fault injection ([`TestBus`]), a recording local installer with
//! per-entry failure injection ([`MockInstaller`]), and a
//! [`TestCluster`] that wires N services together the way a deployment
//! would.

pub mod bus;
pub mod installer;


pub use bus::TestBus;
pub use installer::MockInstaller;

/// Install the opt-in test logger. Honors `RUST_LOG`; repeated calls
/// after the first are no-ops.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::view::ClusterView;
use crate::config::FlowServiceConfig;
use crate::service::FlowService;
use crate::types::NodeId;

/// An in-process cluster of flow services joined by a [`TestBus`].
///
/// Node ids are `1..=n`; every node's membership view contains all of
/// them. Timeouts are shortened so failure paths resolve quickly.
pub struct TestCluster {
    pub bus: Arc<TestBus>,
    services: Vec<Arc<FlowService>>,
    installers: Vec<Arc<MockInstaller>>,
}

impl TestCluster {
    pub fn new(n: usize) -> Self {
        #[cfg(test)]
        init_test_logging();
        let bus = Arc::new(TestBus::new());
        let mut services = Vec::with_capacity(n);
        let mut installers = Vec::with_capacity(n);

        for id in 1..=n as NodeId {
            let view = Arc::new(ClusterView::new(id));
            for peer in 1..=n as NodeId {
                view.add_member(peer);
            }
            let installer = Arc::new(MockInstaller::new());
            let config = FlowServiceConfig::new(id)
                .with_local_timeout(Duration::from_millis(200))
                .with_remote_timeout(Duration::from_millis(600))
                .with_remote_bulk_timeout(Duration::from_millis(1_200))
                .with_txn_timeout(Duration::from_secs(2));
            let service = Arc::new(
                FlowService::new(config, view, installer.clone(), bus.clone())
                    .expect("valid test config"),
            );
            bus.register(id, service.clone());
            services.push(service);
            installers.push(installer);
        }

        Self {
            bus,
            services,
            installers,
        }
    }

    pub fn service(&self, node: NodeId) -> &Arc<FlowService> {
        &self.services[(node - 1) as usize]
    }

    pub fn installer(&self, node: NodeId) -> &Arc<MockInstaller> {
        &self.installers[(node - 1) as usize]
    }
}
