//! Flow-commit service wiring.
//!
//! [`FlowService`] is the one place the collaborators meet: the local
//! installer, the cluster event channel, the membership view, and the
//! per-tenant flow databases. It is constructed once at process start
//! and handed to whoever needs it; there is no ambient container.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cluster::events::{
    ClusterEvent, ClusterEventChannel, FlowModOp, FlowModRequest, FlowModResultEvent,
};
use crate::cluster::relay::FlowRelay;
use crate::cluster::view::ClusterView;
use crate::config::FlowServiceConfig;
use crate::error::Result;
use crate::flow::database::FlowDatabase;
use crate::flow::task::TaskContext;
use crate::installer::FlowInstaller;
use crate::types::NodeId;

/// Cluster-node-local entry point to the flow-commit protocol.
pub struct FlowService {
    config: FlowServiceConfig,
    cluster: Arc<ClusterView>,
    installer: Arc<dyn FlowInstaller>,
    channel: Arc<dyn ClusterEventChannel>,
    relay: Arc<FlowRelay>,
    ctx: Arc<TaskContext>,
    databases: DashMap<String, Arc<FlowDatabase>>,
    shutdown: CancellationToken,
}

impl FlowService {
    /// Wire up the service from its collaborators.
    pub fn new(
        config: FlowServiceConfig,
        cluster: Arc<ClusterView>,
        installer: Arc<dyn FlowInstaller>,
        channel: Arc<dyn ClusterEventChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let relay = Arc::new(FlowRelay::new(config.node_id, Arc::clone(&channel)));
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(TaskContext {
            node_id: config.node_id,
            timeouts: config.timeouts,
            cluster: Arc::clone(&cluster),
            installer: Arc::clone(&installer),
            relay: Arc::clone(&relay),
            shutdown: shutdown.clone(),
        });
        Ok(Self {
            config,
            cluster,
            installer,
            channel,
            relay,
            ctx,
            databases: DashMap::new(),
            shutdown,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The membership view the service classifies locality against.
    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.cluster
    }

    /// The tenant's flow database, created on first use.
    pub fn database(&self, tenant: &str) -> Arc<FlowDatabase> {
        self.databases
            .entry(tenant.to_string())
            .or_insert_with(|| {
                Arc::new(FlowDatabase::new(
                    tenant,
                    Arc::clone(&self.ctx),
                    self.config.txn_timeout,
                ))
            })
            .clone()
    }

    /// Tenants with a database instantiated on this node.
    pub fn tenants(&self) -> Vec<String> {
        self.databases.iter().map(|e| e.key().clone()).collect()
    }

    /// Dispatch one incoming cluster event.
    ///
    /// The channel's listener thread funnels everything through here;
    /// there is exactly one handler per event kind.
    pub async fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::FlowModRequest(request) => self.handle_request(request).await,
            ClusterEvent::FlowModResult(result) => self.relay.handle_result(result),
            ClusterEvent::FlowRemoved { tenant, group } => {
                if let Some(db) = self.databases.get(&tenant) {
                    if let Err(e) = db.flow_removed_group(&group) {
                        tracing::warn!(tenant = %tenant, group = %group, error = %e,
                            "failed to apply peer flow removal");
                    }
                }
            }
        }
    }

    /// Apply a relayed flow modification to the local switches and post
    /// the aggregate result back to the origin.
    async fn handle_request(&self, request: FlowModRequest) {
        let success = match request.op {
            FlowModOp::Add => self.apply_batch(&request).await,
            FlowModOp::Remove => self.sweep_batch(&request).await,
        };

        let result = ClusterEvent::FlowModResult(FlowModResultEvent {
            group: request.group.clone(),
            responder: self.config.node_id,
            success,
        });
        if let Err(e) = self.channel.post(request.origin, result).await {
            tracing::warn!(group = %request.group, origin = request.origin, error = %e,
                "failed to post flow-mod result back to origin");
        }
    }

    /// Install a relayed batch. On rejection the partially applied
    /// prefix is uninstalled again, so a batch that reports failure
    /// leaves no entry of it on this node's switches.
    async fn apply_batch(&self, request: &FlowModRequest) -> bool {
        let mut applied: Vec<&crate::types::FlowEntry> = Vec::new();
        for entry in &request.entries {
            if let Err(e) = self.installer.install(entry).await {
                tracing::warn!(group = %request.group, node = entry.node, error = %e,
                    "relayed install rejected, rolling back batch");
                for undone in applied.into_iter().rev() {
                    if let Err(e) = self.installer.uninstall(undone).await {
                        tracing::warn!(node = undone.node, error = %e,
                            "batch rollback uninstall failed");
                    }
                }
                return false;
            }
            applied.push(entry);
        }
        true
    }

    /// Uninstall a relayed batch, best effort: every entry is attempted
    /// and failures only surface through the aggregate result.
    async fn sweep_batch(&self, request: &FlowModRequest) -> bool {
        let mut success = true;
        for entry in &request.entries {
            if let Err(e) = self.installer.uninstall(entry).await {
                tracing::warn!(group = %request.group, node = entry.node, error = %e,
                    "relayed uninstall rejected");
                success = false;
            }
        }
        success
    }

    /// Cancel the shutdown token and wake pending relays. In-flight
    /// tasks roll back their applied entries and complete as
    /// `Interrupted`.
    pub fn shutdown(&self) {
        tracing::info!(node_id = self.config.node_id, "flow service shutting down");
        self.shutdown.cancel();
        self.relay.abort_pending();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for FlowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowService")
            .field("node_id", &self.config.node_id)
            .field("tenants", &self.databases.len())
            .field("pending_relays", &self.relay.pending_count())
            .finish()
    }
}
