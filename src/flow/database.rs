//! Per-tenant flow registry.
//!
//! The authoritative map from group id to logical flow. Entries appear
//! only after a [`FlowAddTask`] commits and disappear only through a
//! removal path; at no point is a partially-installed flow visible.
//! Every registry mutation that must be visible cluster-wide runs inside
//! a [`CacheTransaction`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flow::group::{FlowGroupId, GroupIdAllocator};
use crate::flow::selector::FlowSelector;
use crate::flow::task::{
    spawn_add_task, spawn_remove_task, CommitFn, CompleteFn, FlowModHandle, FlowModResult,
    TaskContext, TaskState,
};
use crate::flow::vflow::VirtualFlow;
use crate::txn::{CacheTransaction, SharedMap, TxnVerdict};
use crate::types::{FlowEntry, FlowEntryId, Locality, NodeId};

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowDatabaseStats {
    /// Flows currently registered.
    pub registered: usize,
    /// Ingress identities currently indexed.
    pub ingress_entries: usize,
    /// Tasks that completed with `Succeeded`.
    pub tasks_succeeded: u64,
    /// Tasks that completed with any other result.
    pub tasks_failed: u64,
}

/// Per-tenant authoritative store of committed logical flows.
pub struct FlowDatabase {
    tenant: String,
    ctx: Arc<TaskContext>,
    txn_timeout: Duration,

    /// Registry map, replicated cluster-wide.
    map: SharedMap<FlowGroupId, VirtualFlow>,

    /// Group id allocator for this tenant.
    allocator: GroupIdAllocator,

    /// Ingress identity index: exclusive, O(1) membership.
    ingress: Arc<DashMap<FlowEntryId, FlowGroupId>>,

    /// Installs whose task has not completed yet, for idempotent
    /// re-submission of the same group id.
    inflight: Arc<DashMap<FlowGroupId, FlowModHandle>>,

    /// Bumped by `clear()`; an install whose task outlives the bump must
    /// not commit into the emptied registry.
    generation: Arc<AtomicU64>,

    tasks_succeeded: Arc<AtomicU64>,
    tasks_failed: Arc<AtomicU64>,
}

impl FlowDatabase {
    pub(crate) fn new(
        tenant: impl Into<String>,
        ctx: Arc<TaskContext>,
        txn_timeout: Duration,
    ) -> Self {
        let tenant = tenant.into();
        Self {
            allocator: GroupIdAllocator::new(tenant.clone()),
            tenant,
            ctx,
            txn_timeout,
            map: SharedMap::new(),
            ingress: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            tasks_succeeded: Arc::new(AtomicU64::new(0)),
            tasks_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Allocate a fresh, empty flow for the caller to populate.
    pub fn create(&self) -> VirtualFlow {
        VirtualFlow::new(self.allocator.allocate())
    }

    /// Look up a registered flow.
    pub fn get(&self, group: &FlowGroupId) -> Option<VirtualFlow> {
        self.map.get(group)
    }

    /// Number of registered flows.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of every registered flow.
    pub fn flows(&self) -> Vec<VirtualFlow> {
        self.map.values()
    }

    /// Whether `entry` is the ingress entry of a registered flow.
    pub fn contains_ingress_flow(&self, entry: &FlowEntry) -> bool {
        self.ingress.contains_key(&entry.identity())
    }

    /// Current counters.
    pub fn stats(&self) -> FlowDatabaseStats {
        FlowDatabaseStats {
            registered: self.map.len(),
            ingress_entries: self.ingress.len(),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }

    /// Submit a populated flow for commitment.
    ///
    /// Submission fails fast when the service is shutting down or when
    /// the ingress entry is not owned by the local node.
    /// Re-submitting an already-registered group id is a no-op; a group
    /// id with an install still in flight returns the existing handle.
    /// A different group whose ingress identity collides with a
    /// registered ingress is rejected without disturbing the existing
    /// registration. On any non-success outcome every speculatively
    /// installed entry is rolled back and the registry is untouched.
    pub fn install(&self, flow: VirtualFlow) -> Result<FlowModHandle> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let group = flow.group().clone();
        let ingress = flow
            .ingress()
            .ok_or_else(|| Error::EmptyFlow(group.clone()))?;
        if self.ctx.cluster.snapshot().classify(ingress.node) != Locality::Local {
            return Err(Error::IngressNotLocal {
                group,
                owner: ingress.node,
            });
        }
        let ingress_id = ingress.identity();

        if self.map.contains_key(&group) {
            tracing::debug!(group = %group, "install is a no-op, group already registered");
            return Ok(FlowModHandle::completed(FlowModResult::Succeeded));
        }
        if let Some(existing) = self.inflight.get(&group) {
            return Ok(existing.clone());
        }
        // Claim the ingress identity atomically before spawning, so two
        // concurrent installs of the same slot cannot both commit. The
        // claim is released on any non-success completion.
        match self.ingress.entry(ingress_id.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get() != &group {
                    return Err(Error::IngressConflict {
                        existing: occupied.get().clone(),
                    });
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(group.clone());
            }
        }

        let commit: CommitFn = {
            let map = self.map.clone();
            let group = group.clone();
            let flow = flow.clone();
            let txn_timeout = self.txn_timeout;
            let generation = Arc::clone(&self.generation);
            let begin_generation = generation.load(Ordering::SeqCst);
            Box::new(move || {
                if generation.load(Ordering::SeqCst) != begin_generation {
                    return Err(Error::Internal(
                        "registry cleared while install was in flight".into(),
                    ));
                }
                CacheTransaction::new(map, txn_timeout).execute(|txn| {
                    txn.insert(group.clone(), flow.clone());
                    TxnVerdict::Commit(())
                })?;
                Ok(())
            })
        };

        let handle = spawn_add_task(
            Arc::clone(&self.ctx),
            flow,
            commit,
            self.complete_hook(Some((group.clone(), ingress_id))),
        );
        self.inflight.insert(group.clone(), handle.clone());
        // The task may already have completed; never leave a terminal
        // handle parked in the in-flight map.
        if matches!(handle.state(), TaskState::Completed(_)) {
            self.inflight.remove(&group);
        }
        Ok(handle)
    }

    /// Evict and uninstall every registered flow matching `selector`.
    ///
    /// Returns `None` when nothing matched (no task spawned), so callers
    /// can tell "already gone" from "in progress".
    pub fn remove_flows(&self, selector: &FlowSelector) -> Result<Option<FlowModHandle>> {
        let matched: Vec<VirtualFlow> = self
            .map
            .values()
            .into_iter()
            .filter(|flow| selector.matches(flow))
            .collect();
        if matched.is_empty() {
            return Ok(None);
        }

        tracing::debug!(tenant = %self.tenant, selector = ?selector, count = matched.len(),
            "removing flows by selector");
        self.deregister(&matched)?;
        self.announce_removal(&matched);
        let handle = spawn_remove_task(Arc::clone(&self.ctx), matched, self.complete_hook(None));
        Ok(Some(handle))
    }

    /// Remove and uninstall every flow in the tenant, waiting for the
    /// uninstalls to finish. By the time this returns the registry is
    /// empty and no physical entry of a formerly-registered flow remains.
    pub async fn clear(&self) -> Result<FlowModResult> {
        // Invalidate installs still in flight; their commit will abort
        // and the task rolls back its own entries.
        self.generation.fetch_add(1, Ordering::SeqCst);

        let flows = self.map.values();
        CacheTransaction::new(self.map.clone(), self.txn_timeout).execute(|txn| {
            txn.clear();
            TxnVerdict::Commit(())
        })?;
        self.ingress.clear();

        if flows.is_empty() {
            return Ok(FlowModResult::Succeeded);
        }
        self.announce_removal(&flows);

        tracing::info!(tenant = %self.tenant, count = flows.len(), "clearing tenant flows");
        let handle = spawn_remove_task(Arc::clone(&self.ctx), flows, self.complete_hook(None));
        let bound = self.ctx.timeouts.remote_bulk + self.ctx.timeouts.local;
        Ok(handle.result(bound).await)
    }

    /// Reactive hook for a switch-level flow eviction.
    ///
    /// A non-ingress eviction is insignificant: the hop will be cleaned
    /// up whenever its flow is torn down. An ingress eviction invalidates
    /// the whole logical flow, which is deregistered and its remaining
    /// hops uninstalled.
    pub fn flow_removed(&self, entry: &FlowEntry) -> Result<Option<FlowModHandle>> {
        let Some(group) = self.ingress.get(&entry.identity()).map(|g| g.clone()) else {
            return Ok(None);
        };
        let Some(flow) = self.map.get(&group) else {
            // The claim may belong to an install still in flight; leave
            // it for that install's completion hook to settle.
            return Ok(None);
        };

        tracing::info!(group = %group, node = entry.node,
            "ingress entry evicted by switch, tearing down flow");
        self.deregister(std::slice::from_ref(&flow))?;
        self.announce_removal(std::slice::from_ref(&flow));

        // The ingress entry is already gone from the switch; only the
        // remaining hops need uninstalling.
        let mut remainder = VirtualFlow::new(flow.group().clone());
        for hop in flow.entries().iter().skip(1) {
            remainder.add_entry(hop.clone());
        }
        if remainder.is_empty() {
            return Ok(Some(FlowModHandle::completed(FlowModResult::Succeeded)));
        }
        let handle = spawn_remove_task(
            Arc::clone(&self.ctx),
            vec![remainder],
            self.complete_hook(None),
        );
        Ok(Some(handle))
    }

    /// Reactive hook for a peer reporting that a group was removed.
    /// Registry-only: the peer already drove the uninstalls.
    pub fn flow_removed_group(&self, group: &FlowGroupId) -> Result<()> {
        let Some(flow) = self.map.get(group) else {
            return Ok(());
        };
        self.deregister(std::slice::from_ref(&flow))
    }

    /// Tell every peer that these groups were deregistered here, so
    /// their registries converge. The peers apply it registry-only;
    /// uninstalls are driven by this node alone.
    fn announce_removal(&self, flows: &[VirtualFlow]) {
        let peers: Vec<NodeId> = self
            .ctx
            .cluster
            .members()
            .into_iter()
            .filter(|&n| n != self.ctx.node_id)
            .collect();
        if peers.is_empty() {
            return;
        }
        for flow in flows {
            let relay = Arc::clone(&self.ctx.relay);
            let peers = peers.clone();
            let tenant = self.tenant.clone();
            let group = flow.group().clone();
            tokio::spawn(async move {
                relay.announce_removed(&peers, &tenant, group).await;
            });
        }
    }

    /// Drop flows from the registry map and the ingress index, inside
    /// one cache transaction.
    fn deregister(&self, flows: &[VirtualFlow]) -> Result<()> {
        CacheTransaction::new(self.map.clone(), self.txn_timeout).execute(|txn| {
            for flow in flows {
                txn.remove(flow.group().clone());
            }
            TxnVerdict::Commit(())
        })?;
        for flow in flows {
            if let Some(id) = flow.ingress_identity() {
                self.ingress.remove(&id);
            }
        }
        Ok(())
    }

    fn complete_hook(&self, install: Option<(FlowGroupId, FlowEntryId)>) -> CompleteFn {
        let succeeded = Arc::clone(&self.tasks_succeeded);
        let failed = Arc::clone(&self.tasks_failed);
        let inflight = Arc::clone(&self.inflight);
        let ingress = Arc::clone(&self.ingress);
        Box::new(move |result: FlowModResult| {
            if result.is_success() {
                succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
            }
            if let Some((group, ingress_id)) = install {
                inflight.remove(&group);
                if !result.is_success() {
                    // Release the claim only if this install still owns it.
                    ingress.remove_if(&ingress_id, |_, owner| owner == &group);
                }
            }
        })
    }
}

impl std::fmt::Debug for FlowDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDatabase")
            .field("tenant", &self.tenant)
            .field("registered", &self.map.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::events::{ClusterEvent, ClusterEventChannel};
    use crate::cluster::relay::FlowRelay;
    use crate::cluster::view::ClusterView;
    use crate::config::FlowModTimeouts;
    use crate::installer::FlowInstaller;
    use crate::testing::installer::MockInstaller;
    use crate::types::{FlowAction, FlowMatch, NodeId};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct SilentChannel;

    #[async_trait]
    impl ClusterEventChannel for SilentChannel {
        async fn post(&self, _target: NodeId, _event: ClusterEvent) -> Result<()> {
            Ok(())
        }
    }

    fn database(local: NodeId) -> (FlowDatabase, Arc<MockInstaller>) {
        let installer = Arc::new(MockInstaller::new());
        let cluster = Arc::new(ClusterView::new(local));
        cluster.add_member(2);
        let ctx = Arc::new(TaskContext {
            node_id: local,
            timeouts: FlowModTimeouts {
                local: Duration::from_millis(200),
                remote: Duration::from_millis(200),
                remote_bulk: Duration::from_millis(400),
            },
            cluster,
            installer: installer.clone(),
            relay: Arc::new(FlowRelay::new(local, Arc::new(SilentChannel))),
            shutdown: CancellationToken::new(),
        });
        (FlowDatabase::new("t", ctx, Duration::from_secs(1)), installer)
    }

    fn entry(node: NodeId, in_port: u32) -> FlowEntry {
        FlowEntry::new(
            node,
            200,
            FlowMatch::in_port(in_port),
            vec![FlowAction::Output(in_port + 1)],
        )
    }

    #[tokio::test]
    async fn test_install_registers_local_flow() {
        let (db, installer) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));

        let handle = db.install(flow.clone()).unwrap();
        assert_eq!(
            handle.result(Duration::from_secs(1)).await,
            FlowModResult::Succeeded
        );
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(flow.group()).unwrap(), flow);
        assert!(db.contains_ingress_flow(&flow.entries()[0]));
        assert_eq!(installer.installed_count(), 1);
    }

    #[tokio::test]
    async fn test_install_is_idempotent_per_group() {
        let (db, installer) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));

        db.install(flow.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;
        let second = db.install(flow).unwrap();
        assert_eq!(
            second.result(Duration::from_secs(1)).await,
            FlowModResult::Succeeded
        );
        assert_eq!(db.len(), 1);
        assert_eq!(installer.installed_count(), 1);
    }

    #[tokio::test]
    async fn test_ingress_conflict_rejected_without_disturbing_existing() {
        let (db, _installer) = database(1);
        let mut first = db.create();
        first.add_entry(entry(1, 10));
        db.install(first.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;

        // Different group, physically identical ingress slot.
        let mut second = db.create();
        second.add_entry(entry(1, 10));
        let err = db.install(second).unwrap_err();
        assert!(
            matches!(err, Error::IngressConflict { ref existing } if existing == first.group())
        );
        assert_eq!(db.len(), 1);
        assert!(db.get(first.group()).is_some());
    }

    #[tokio::test]
    async fn test_inflight_install_holds_ingress_claim() {
        let (db, _installer) = database(1);

        // Flow `a` has a remote hop; the silent channel never answers,
        // so its install stays in flight until the remote timeout.
        let mut a = db.create();
        a.add_entry(entry(1, 10));
        a.add_entry(entry(2, 50));
        let a_handle = db.install(a).unwrap();

        // While `a` is in flight, a different group wanting the same
        // ingress slot must be turned away.
        let mut b = db.create();
        b.add_entry(entry(1, 10));
        let err = db.install(b.clone()).unwrap_err();
        assert!(matches!(err, Error::IngressConflict { .. }));

        // Once `a` fails, the claim is released and `b` can land.
        assert_eq!(
            a_handle.result(Duration::from_secs(1)).await,
            FlowModResult::TimedOut
        );
        let handle = db.install(b).unwrap();
        assert_eq!(
            handle.result(Duration::from_secs(1)).await,
            FlowModResult::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failed_install_leaves_registry_untouched() {
        let (db, installer) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));
        flow.add_entry(entry(1, 20));
        installer.fail_on(flow.entries()[1].identity());

        let handle = db.install(flow.clone()).unwrap();
        assert_eq!(
            handle.result(Duration::from_secs(1)).await,
            FlowModResult::Failed
        );
        assert_eq!(db.len(), 0);
        assert!(!db.contains_ingress_flow(&flow.entries()[0]));
        assert_eq!(installer.installed_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_flow_rejected() {
        let (db, _) = database(1);
        let flow = db.create();
        assert!(matches!(db.install(flow), Err(Error::EmptyFlow(_))));
    }

    #[tokio::test]
    async fn test_remove_flows_by_port_selector() {
        let (db, installer) = database(1);
        let mut a = db.create();
        a.add_entry(entry(1, 10));
        let mut b = db.create();
        b.add_entry(entry(1, 20));

        db.install(a.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;
        db.install(b.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;

        // Port selector matches only flow `a` (in_port 10 / output 11).
        let handle = db
            .remove_flows(&FlowSelector::Port(1, 10))
            .unwrap()
            .expect("one flow matched");
        assert_eq!(
            handle.result(Duration::from_secs(1)).await,
            FlowModResult::Succeeded
        );

        assert_eq!(db.len(), 1);
        assert!(db.get(a.group()).is_none());
        // The survivor is untouched, identity and contents.
        assert_eq!(db.get(b.group()).unwrap(), b);
        assert_eq!(installer.installed_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_flows_nothing_matched_returns_none() {
        let (db, _) = database(1);
        let mut a = db.create();
        a.add_entry(entry(1, 10));
        db.install(a).unwrap().result(Duration::from_secs(1)).await;

        assert!(db.remove_flows(&FlowSelector::Node(99)).unwrap().is_none());
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_registry_and_switches() {
        let (db, installer) = database(1);
        for port in [10, 20, 30] {
            let mut flow = db.create();
            flow.add_entry(entry(1, port));
            db.install(flow)
                .unwrap()
                .result(Duration::from_secs(1))
                .await;
        }
        assert_eq!(db.len(), 3);

        let result = db.clear().await.unwrap();
        assert_eq!(result, FlowModResult::Succeeded);
        assert!(db.is_empty());
        assert_eq!(db.stats().ingress_entries, 0);
        assert_eq!(installer.installed_count(), 0);
    }

    #[tokio::test]
    async fn test_ingress_eviction_tears_down_whole_flow() {
        let (db, installer) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));
        flow.add_entry(entry(1, 20));
        db.install(flow.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;

        // The switch reports the ingress entry evicted (idle timeout).
        installer.uninstall(&flow.entries()[0]).await.unwrap();
        let handle = db
            .flow_removed(&flow.entries()[0])
            .unwrap()
            .expect("teardown spawned");
        assert_eq!(
            handle.result(Duration::from_secs(1)).await,
            FlowModResult::Succeeded
        );

        assert_eq!(db.len(), 0);
        assert_eq!(installer.installed_count(), 0);
    }

    #[tokio::test]
    async fn test_non_ingress_eviction_is_ignored() {
        let (db, _) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));
        flow.add_entry(entry(1, 20));
        db.install(flow.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;

        assert!(db.flow_removed(&flow.entries()[1]).unwrap().is_none());
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_group_removal_is_registry_only() {
        let (db, installer) = database(1);
        let mut flow = db.create();
        flow.add_entry(entry(1, 10));
        db.install(flow.clone())
            .unwrap()
            .result(Duration::from_secs(1))
            .await;

        db.flow_removed_group(flow.group()).unwrap();
        assert_eq!(db.len(), 0);
        assert!(!db.contains_ingress_flow(&flow.entries()[0]));
        // No uninstall was driven locally.
        assert_eq!(installer.installed_count(), 1);
    }

    #[tokio::test]
    async fn test_create_allocates_distinct_groups() {
        let (db, _) = database(1);
        let a = db.create();
        let b = db.create();
        assert_ne!(a.group(), b.group());
        assert_eq!(a.group().tenant(), "t");
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let (db, installer) = database(1);
        let mut ok = db.create();
        ok.add_entry(entry(1, 10));
        db.install(ok).unwrap().result(Duration::from_secs(1)).await;

        let mut bad = db.create();
        bad.add_entry(entry(1, 20));
        installer.fail_on(bad.entries()[0].identity());
        db.install(bad).unwrap().result(Duration::from_secs(1)).await;

        let stats = db.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.tasks_succeeded, 1);
        assert_eq!(stats.tasks_failed, 1);
    }
}
