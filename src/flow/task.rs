//! Flow modification tasks.
//!
//! A task decomposes one logical flow (or, for bulk removal, a set of
//! them) into ingress, local, and remote physical entries, applies the
//! local ones through the local flow installer, relays the remote ones to
//! their owning nodes, and reports one aggregate result. Ordering inside
//! a task is fixed: ingress first, then local entries, then remote
//! relays, since a peer may need the ingress entry to exist before
//! accepting a relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::cluster::events::{FlowModOp, FlowModResultEvent};
use crate::cluster::relay::FlowRelay;
use crate::cluster::view::{ClusterView, MembershipSnapshot};
use crate::config::FlowModTimeouts;
use crate::error::Result;
use crate::flow::group::FlowGroupId;
use crate::flow::vflow::VirtualFlow;
use crate::installer::FlowInstaller;
use crate::types::{FlowEntry, Locality, NodeId};

/// Aggregate outcome of a flow modification task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModResult {
    /// Ingress, every local, and every remote operation succeeded.
    Succeeded,
    /// An installer rejected an entry, a relay was refused, or an owning
    /// node was not a cluster member.
    Failed,
    /// The deadline elapsed before all results arrived.
    TimedOut,
    /// The waiting task was interrupted (service shutdown, relay closed).
    Interrupted,
}

impl FlowModResult {
    /// Whether the flow is committed from the registry's point of view.
    pub fn is_success(self) -> bool {
        matches!(self, FlowModResult::Succeeded)
    }
}

/// Observable state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed(FlowModResult),
}

/// Everything a task needs from its surrounding service.
pub struct TaskContext {
    /// Local cluster node id.
    pub node_id: NodeId,
    /// Flow-mod timeout budget.
    pub timeouts: FlowModTimeouts,
    /// Cluster membership, queried once per task.
    pub cluster: Arc<ClusterView>,
    /// Local switch flow-table capability.
    pub installer: Arc<dyn FlowInstaller>,
    /// Remote relay.
    pub relay: Arc<FlowRelay>,
    /// Service shutdown token; cancellation interrupts waiting tasks.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("node_id", &self.node_id)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// Caller-side handle to a running (or finished) task.
///
/// A caller-side timeout in [`result`](Self::result) never perturbs the
/// task itself; a late completion stays observable to any later caller.
#[derive(Debug, Clone)]
pub struct FlowModHandle {
    state: watch::Receiver<TaskState>,
}

impl FlowModHandle {
    /// Handle for a task that never needed to run (idempotent install).
    pub(crate) fn completed(result: FlowModResult) -> Self {
        let (_tx, rx) = watch::channel(TaskState::Completed(result));
        Self { state: rx }
    }

    /// Current task state.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Wait up to `timeout` for the task's terminal result.
    pub async fn result(&self, timeout: Duration) -> FlowModResult {
        self.result_at(tokio::time::Instant::now() + timeout).await
    }

    /// Wait until `deadline` for the task's terminal result.
    pub async fn result_at(&self, deadline: tokio::time::Instant) -> FlowModResult {
        let mut rx = self.state.clone();
        // Copy the state out of the watch guard before yielding it.
        let wait = async move {
            let state = rx.wait_for(|s| matches!(s, TaskState::Completed(_))).await?;
            Ok::<_, watch::error::RecvError>(*state)
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(TaskState::Completed(result))) => result,
            Ok(Ok(_)) => unreachable!("wait_for only yields completed states"),
            // Publisher dropped without completing: the task was torn down.
            Ok(Err(_)) => FlowModResult::Interrupted,
            Err(_) => FlowModResult::TimedOut,
        }
    }
}

/// Registry write performed iff the task succeeds.
pub(crate) type CommitFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Bookkeeping hook invoked with the final result, before it is published.
pub(crate) type CompleteFn = Box<dyn FnOnce(FlowModResult) + Send>;

/// Physical entries of one task, split by locality.
struct EntryPlan {
    /// Local entries in hop order; the ingress entry leads when local.
    local: Vec<FlowEntry>,
    /// Remote entries grouped by owning node, correlation group per node.
    remote: HashMap<NodeId, (FlowGroupId, Vec<FlowEntry>)>,
    /// Owners absent from cluster membership.
    disconnected: Vec<NodeId>,
}

fn partition(flows: &[VirtualFlow], snapshot: &MembershipSnapshot) -> EntryPlan {
    let mut plan = EntryPlan {
        local: Vec::new(),
        remote: HashMap::new(),
        disconnected: Vec::new(),
    };
    for flow in flows {
        for entry in flow.entries() {
            match snapshot.classify(entry.node) {
                Locality::Local => plan.local.push(entry.clone()),
                Locality::Remote => {
                    plan.remote
                        .entry(entry.node)
                        .or_insert_with(|| (flow.group().clone(), Vec::new()))
                        .1
                        .push(entry.clone());
                }
                Locality::Disconnected => {
                    if !plan.disconnected.contains(&entry.node) {
                        plan.disconnected.push(entry.node);
                    }
                }
            }
        }
    }
    plan
}

/// Outcome of waiting for the remote fan-out.
enum RemoteWait {
    AllSucceeded,
    Rejected(NodeId),
    ChannelClosed,
}

/// Resolve relay receivers in completion order, recording every node
/// that acknowledged success into `acked`. Drains all receivers even
/// after a rejection so a failing task knows exactly which peers to
/// compensate; the caller bounds the whole wait with a timeout, and a
/// cancelled wait keeps the acknowledgements recorded so far.
async fn await_remote_results(
    receivers: Vec<(NodeId, oneshot::Receiver<FlowModResultEvent>)>,
    acked: &mut Vec<NodeId>,
) -> RemoteWait {
    let total = receivers.len();
    let (tx, mut results) = mpsc::unbounded_channel();
    for (node, receiver) in receivers {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send((node, receiver.await));
        });
    }
    drop(tx);

    let mut verdict = RemoteWait::AllSucceeded;
    let mut resolved = 0;
    while resolved < total {
        let Some((node, outcome)) = results.recv().await else {
            break;
        };
        resolved += 1;
        match outcome {
            Ok(result) if result.success => acked.push(node),
            Ok(result) => verdict = RemoteWait::Rejected(result.responder),
            Err(_) => {
                if matches!(verdict, RemoteWait::AllSucceeded) {
                    verdict = RemoteWait::ChannelClosed;
                }
            }
        }
    }
    verdict
}

/// Spawn a [`FlowAddTask`] installing one logical flow.
pub(crate) fn spawn_add_task(
    ctx: Arc<TaskContext>,
    flow: VirtualFlow,
    commit: CommitFn,
    on_complete: CompleteFn,
) -> FlowModHandle {
    let (tx, rx) = watch::channel(TaskState::Created);
    tokio::spawn(async move {
        let _ = tx.send(TaskState::Running);
        let mut task = FlowAddTask::new(ctx, flow);
        let mut result = task.run().await;
        if result.is_success() {
            if let Err(e) = commit() {
                tracing::error!(group = %task.flow.group(), error = %e,
                    "registry commit failed after successful install, rolling back");
                task.rollback().await;
                result = FlowModResult::Failed;
            }
        }
        on_complete(result);
        let _ = tx.send(TaskState::Completed(result));
    });
    FlowModHandle { state: rx }
}

/// Spawn a [`FlowRemoveTask`] uninstalling one or more logical flows.
pub(crate) fn spawn_remove_task(
    ctx: Arc<TaskContext>,
    flows: Vec<VirtualFlow>,
    on_complete: CompleteFn,
) -> FlowModHandle {
    let (tx, rx) = watch::channel(TaskState::Created);
    tokio::spawn(async move {
        let _ = tx.send(TaskState::Running);
        let task = FlowRemoveTask { ctx, flows };
        let result = task.run().await;
        on_complete(result);
        let _ = tx.send(TaskState::Completed(result));
    });
    FlowModHandle { state: rx }
}

/// Installs the physical entries of one logical flow.
struct FlowAddTask {
    ctx: Arc<TaskContext>,
    flow: VirtualFlow,
    /// Local entries applied so far, in application order.
    applied: Vec<FlowEntry>,
    /// Remote nodes that acknowledged their batch.
    acked: Vec<NodeId>,
    /// Relayed batch per remote node, kept for compensation.
    remote_batches: HashMap<NodeId, Vec<FlowEntry>>,
}

impl FlowAddTask {
    fn new(ctx: Arc<TaskContext>, flow: VirtualFlow) -> Self {
        Self {
            ctx,
            flow,
            applied: Vec::new(),
            acked: Vec::new(),
            remote_batches: HashMap::new(),
        }
    }

    async fn run(&mut self) -> FlowModResult {
        let group = self.flow.group().clone();
        let snapshot = self.ctx.cluster.snapshot();

        let ingress = match self.flow.ingress() {
            Some(entry) => entry.clone(),
            None => {
                tracing::warn!(group = %group, "rejecting install of empty flow");
                return FlowModResult::Failed;
            }
        };

        let plan = partition(std::slice::from_ref(&self.flow), &snapshot);
        if !plan.disconnected.is_empty() {
            tracing::warn!(group = %group, nodes = ?plan.disconnected,
                "owning nodes not in cluster membership, failing without relay");
            return FlowModResult::Failed;
        }
        if snapshot.classify(ingress.node) != Locality::Local {
            tracing::warn!(group = %group, owner = ingress.node,
                "ingress entry not owned by local node");
            return FlowModResult::Failed;
        }

        // Ingress first, then the remaining local hops. plan.local keeps
        // hop order, so plan.local[0] is the ingress entry.
        for entry in &plan.local {
            if self.ctx.shutdown.is_cancelled() {
                self.rollback().await;
                return FlowModResult::Interrupted;
            }
            if let Err(e) = self.ctx.installer.install(entry).await {
                tracing::warn!(group = %group, node = entry.node, error = %e,
                    "local install rejected");
                self.rollback().await;
                return FlowModResult::Failed;
            }
            self.applied.push(entry.clone());
        }

        // Fan out one relay per distinct remote owner, keeping each
        // batch around so a later failure can compensate it.
        self.remote_batches = plan
            .remote
            .into_iter()
            .map(|(node, (_, entries))| (node, entries))
            .collect();
        let mut receivers = Vec::with_capacity(self.remote_batches.len());
        for (node, entries) in &self.remote_batches {
            match self
                .ctx
                .relay
                .request(*node, group.clone(), FlowModOp::Add, entries.clone())
                .await
            {
                Ok(rx) => receivers.push((*node, rx)),
                Err(e) => {
                    tracing::warn!(group = %group, node = *node, error = %e,
                        "relay post failed");
                    self.rollback().await;
                    return FlowModResult::Failed;
                }
            }
        }
        if receivers.is_empty() {
            return FlowModResult::Succeeded;
        }

        let deadline = self.ctx.timeouts.remote;
        let shutdown = self.ctx.shutdown.clone();
        let result = tokio::select! {
            _ = shutdown.cancelled() => FlowModResult::Interrupted,
            wait = tokio::time::timeout(deadline, await_remote_results(receivers, &mut self.acked)) => {
                match wait {
                    Err(_) => FlowModResult::TimedOut,
                    Ok(RemoteWait::AllSucceeded) => FlowModResult::Succeeded,
                    Ok(RemoteWait::Rejected(node)) => {
                        tracing::warn!(group = %group, node, "remote peer rejected flow entries");
                        FlowModResult::Failed
                    }
                    Ok(RemoteWait::ChannelClosed) => FlowModResult::Interrupted,
                }
            }
        };

        if !result.is_success() {
            self.rollback().await;
        }
        result
    }

    /// Undo everything the task has applied: uninstall local entries
    /// newest first, then relay a compensating remove to every remote
    /// node that acknowledged its batch, so no switch keeps an entry for
    /// a group the registry never committed. Best effort; individual
    /// failures are logged and do not stop the sweep.
    async fn rollback(&self) {
        for entry in self.applied.iter().rev() {
            if let Err(e) = self.ctx.installer.uninstall(entry).await {
                tracing::warn!(group = %self.flow.group(), node = entry.node, error = %e,
                    "rollback uninstall failed");
            }
        }

        let group = self.flow.group();
        for &node in &self.acked {
            let Some(entries) = self.remote_batches.get(&node) else {
                continue;
            };
            let confirmed = match self
                .ctx
                .relay
                .request(node, group.clone(), FlowModOp::Remove, entries.clone())
                .await
            {
                Ok(rx) => matches!(
                    tokio::time::timeout(self.ctx.timeouts.remote, rx).await,
                    Ok(Ok(result)) if result.success
                ),
                Err(_) => false,
            };
            if !confirmed {
                tracing::warn!(group = %group, node,
                    "compensating remove not confirmed by peer");
            }
        }
    }
}

/// Uninstalls the physical entries of one or more logical flows.
///
/// Carries no rollback: a removed flow is never resurrected, and partial
/// failures surface only through the aggregate result.
struct FlowRemoveTask {
    ctx: Arc<TaskContext>,
    flows: Vec<VirtualFlow>,
}

impl FlowRemoveTask {
    async fn run(&self) -> FlowModResult {
        let snapshot = self.ctx.cluster.snapshot();
        let plan = partition(&self.flows, &snapshot);

        if !plan.disconnected.is_empty() {
            tracing::warn!(nodes = ?plan.disconnected, flows = self.flows.len(),
                "owning nodes not in cluster membership, failing removal without relay");
            return FlowModResult::Failed;
        }

        // The flows are already deregistered, so the sweep is best
        // effort: a rejected hop is logged and aggregated into the
        // result, never allowed to strand the hops after it.
        let mut failed = false;

        // Local uninstalls in hop order; a flow's ingress leads its hops.
        for entry in &plan.local {
            if self.ctx.shutdown.is_cancelled() {
                return FlowModResult::Interrupted;
            }
            if let Err(e) = self.ctx.installer.uninstall(entry).await {
                tracing::warn!(node = entry.node, error = %e, "local uninstall rejected");
                failed = true;
            }
        }

        // One relay per remote owner, batching entries across all flows.
        let mut receivers = Vec::with_capacity(plan.remote.len());
        for (node, (corr_group, entries)) in plan.remote {
            match self
                .ctx
                .relay
                .request(node, corr_group, FlowModOp::Remove, entries)
                .await
            {
                Ok(rx) => receivers.push((node, rx)),
                Err(e) => {
                    tracing::warn!(node, error = %e, "removal relay post failed");
                    failed = true;
                }
            }
        }

        let verdict = if receivers.is_empty() {
            FlowModResult::Succeeded
        } else {
            let deadline = self.ctx.timeouts.remote_for(self.flows.len());
            let mut acked = Vec::new();
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => FlowModResult::Interrupted,
                wait = tokio::time::timeout(deadline, await_remote_results(receivers, &mut acked)) => {
                    match wait {
                        Err(_) => FlowModResult::TimedOut,
                        Ok(RemoteWait::AllSucceeded) => FlowModResult::Succeeded,
                        Ok(RemoteWait::Rejected(node)) => {
                            tracing::warn!(node, "remote peer rejected flow removal");
                            FlowModResult::Failed
                        }
                        Ok(RemoteWait::ChannelClosed) => FlowModResult::Interrupted,
                    }
                }
            }
        };

        match verdict {
            FlowModResult::Succeeded if failed => FlowModResult::Failed,
            other => other,
        }
    }
}
