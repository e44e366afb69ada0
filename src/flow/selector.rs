//! Selectors for bulk flow removal.

use std::fmt;
use std::sync::Arc;

use crate::flow::group::FlowGroupId;
use crate::flow::vflow::VirtualFlow;
use crate::types::{MacVlan, NodeId, VirtualPath};

/// Predicate choosing which registered flows a removal evicts.
#[derive(Clone)]
pub enum FlowSelector {
    /// Flows with an entry on a switch owned by the node.
    Node(NodeId),

    /// Flows referencing the given node connector (port).
    Port(NodeId, u32),

    /// Flows depending on a virtual-topology element covered by the path.
    Path(VirtualPath),

    /// Flows depending on the given L2 host binding.
    Host(MacVlan),

    /// An explicit caller-supplied list of groups.
    Groups(Vec<FlowGroupId>),

    /// Arbitrary caller-supplied predicate.
    Predicate(Arc<dyn Fn(&VirtualFlow) -> bool + Send + Sync>),
}

impl FlowSelector {
    /// Build a predicate selector from a closure.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&VirtualFlow) -> bool + Send + Sync + 'static,
    {
        FlowSelector::Predicate(Arc::new(f))
    }

    /// Whether the selector matches a registered flow.
    pub fn matches(&self, flow: &VirtualFlow) -> bool {
        match self {
            FlowSelector::Node(node) => flow.depends_on_node(*node),
            FlowSelector::Port(node, port) => flow.depends_on_port(*node, *port),
            FlowSelector::Path(path) => flow.depends_on_path(path),
            FlowSelector::Host(host) => flow.depends_on_host(host),
            FlowSelector::Groups(groups) => groups.contains(flow.group()),
            FlowSelector::Predicate(pred) => pred(flow),
        }
    }
}

impl fmt::Debug for FlowSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowSelector::Node(node) => write!(f, "Node({node})"),
            FlowSelector::Port(node, port) => write!(f, "Port({node}, {port})"),
            FlowSelector::Path(path) => write!(f, "Path({path})"),
            FlowSelector::Host(host) => write!(f, "Host({host})"),
            FlowSelector::Groups(groups) => write!(f, "Groups({} ids)", groups.len()),
            FlowSelector::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowAction, FlowEntry, FlowMatch};

    fn flow(id: u64, node: NodeId) -> VirtualFlow {
        let mut flow = VirtualFlow::new(FlowGroupId::new("t", id));
        flow.add_entry(FlowEntry::new(
            node,
            200,
            FlowMatch::in_port(10),
            vec![FlowAction::Output(11)],
        ));
        flow
    }

    #[test]
    fn test_node_selector() {
        let f = flow(1, 5);
        assert!(FlowSelector::Node(5).matches(&f));
        assert!(!FlowSelector::Node(6).matches(&f));
    }

    #[test]
    fn test_port_selector() {
        let f = flow(1, 5);
        assert!(FlowSelector::Port(5, 10).matches(&f));
        assert!(FlowSelector::Port(5, 11).matches(&f));
        assert!(!FlowSelector::Port(5, 12).matches(&f));
        assert!(!FlowSelector::Port(6, 10).matches(&f));
    }

    #[test]
    fn test_groups_selector() {
        let f = flow(1, 5);
        assert!(FlowSelector::Groups(vec![FlowGroupId::new("t", 1)]).matches(&f));
        assert!(!FlowSelector::Groups(vec![FlowGroupId::new("t", 2)]).matches(&f));
    }

    #[test]
    fn test_predicate_selector() {
        let f = flow(1, 5);
        let sel = FlowSelector::predicate(|flow| flow.group().id() == 1);
        assert!(sel.matches(&f));
        assert!(!sel.matches(&flow(2, 5)));
    }

    #[test]
    fn test_host_selector() {
        let mut f = flow(1, 5);
        let host = MacVlan::new([1, 2, 3, 4, 5, 6], 10);
        f.add_host_dependency(host);
        assert!(FlowSelector::Host(host).matches(&f));
        assert!(!FlowSelector::Host(MacVlan::new([1, 2, 3, 4, 5, 6], 11)).matches(&f));
    }
}
