//! Logical flows.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::flow::group::FlowGroupId;
use crate::types::{FlowEntry, FlowEntryId, MacVlan, NodeId, VirtualPath};

/// One virtual-network forwarding decision, realized as an ordered list
/// of physical flow entries (one per switch hop, entry 0 = ingress) plus
/// the set of virtual-topology paths and L2 hosts its correctness
/// depends on.
///
/// Two flows are equal iff they have the same group id; entry contents
/// are irrelevant to registry identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFlow {
    group: FlowGroupId,
    entries: Vec<FlowEntry>,
    path_deps: HashSet<VirtualPath>,
    host_deps: HashSet<MacVlan>,
}

impl VirtualFlow {
    /// Create an empty flow. Populated by the caller before install.
    pub fn new(group: FlowGroupId) -> Self {
        Self {
            group,
            entries: Vec::new(),
            path_deps: HashSet::new(),
            host_deps: HashSet::new(),
        }
    }

    pub fn group(&self) -> &FlowGroupId {
        &self.group
    }

    /// Append the next hop's physical entry. The first entry added is
    /// the ingress entry, the flow's liveness anchor.
    pub fn add_entry(&mut self, entry: FlowEntry) {
        self.entries.push(entry);
    }

    /// Record a virtual-topology dependency.
    pub fn add_path_dependency(&mut self, path: VirtualPath) {
        self.path_deps.insert(path);
    }

    /// Record an L2 host dependency.
    pub fn add_host_dependency(&mut self, host: MacVlan) {
        self.host_deps.insert(host);
    }

    /// Drop every entry and path dependency, keeping the group id.
    pub fn clear_virtual_route(&mut self) {
        self.entries.clear();
        self.path_deps.clear();
    }

    /// All physical entries in hop order.
    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    /// The ingress entry, if the flow has been populated.
    pub fn ingress(&self) -> Option<&FlowEntry> {
        self.entries.first()
    }

    /// Identity of the ingress entry.
    pub fn ingress_identity(&self) -> Option<FlowEntryId> {
        self.ingress().map(FlowEntry::identity)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path_dependencies(&self) -> &HashSet<VirtualPath> {
        &self.path_deps
    }

    pub fn host_dependencies(&self) -> &HashSet<MacVlan> {
        &self.host_deps
    }

    /// Whether any entry lives on a switch owned by `node`.
    pub fn depends_on_node(&self, node: NodeId) -> bool {
        self.entries.iter().any(|e| e.node == node)
    }

    /// Whether any entry references the given node connector.
    pub fn depends_on_port(&self, node: NodeId, port: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.node == node && e.references_port(port))
    }

    /// Whether the flow depends on a virtual-topology element covered by
    /// `path` (a node path matches all of its interfaces).
    pub fn depends_on_path(&self, path: &VirtualPath) -> bool {
        self.path_deps.iter().any(|dep| dep.covered_by(path))
    }

    /// Whether the flow depends on the given L2 host.
    pub fn depends_on_host(&self, host: &MacVlan) -> bool {
        self.host_deps.contains(host)
    }

    /// Whether `id` is the identity of one of this flow's entries.
    pub fn contains_entry(&self, id: &FlowEntryId) -> bool {
        self.entries.iter().any(|e| &e.identity() == id)
    }
}

impl PartialEq for VirtualFlow {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
    }
}

impl Eq for VirtualFlow {}

impl Hash for VirtualFlow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
    }
}
