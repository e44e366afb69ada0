//! Core value types used throughout the flow-commit protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster node identifier. Each physical switch is owned by exactly one node.
pub type NodeId = u64;

/// A MAC address as raw octets.
pub type MacAddr = [u8; 6];

/// An L2 host identity: MAC address plus VLAN id.
///
/// Flows record the hosts they forward between so that a host moving or
/// aging out can evict every flow that depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacVlan {
    pub mac: MacAddr,
    pub vlan: u16,
}

impl MacVlan {
    pub fn new(mac: MacAddr, vlan: u16) -> Self {
        Self { mac, vlan }
    }
}

impl fmt::Display for MacVlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.mac;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}@{}",
            m[0], m[1], m[2], m[3], m[4], m[5], self.vlan
        )
    }
}

/// Reference to a virtual-topology element a flow depends on.
///
/// Covers the ingress/egress virtual nodes of a path and any intermediate
/// virtual node, identified by tenant-scoped component names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualPath {
    /// Owning tenant.
    pub tenant: String,
    /// Virtual bridge or router name.
    pub node: String,
    /// Optional virtual interface within the node.
    pub interface: Option<String>,
}

impl VirtualPath {
    pub fn node(tenant: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            node: node.into(),
            interface: None,
        }
    }

    pub fn interface(
        tenant: impl Into<String>,
        node: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            node: node.into(),
            interface: Some(interface.into()),
        }
    }

    /// Whether `other` covers this path: a node path covers all of its
    /// interface paths, an interface path covers only itself.
    pub fn covered_by(&self, other: &VirtualPath) -> bool {
        if self.tenant != other.tenant || self.node != other.node {
            return false;
        }
        match (&self.interface, &other.interface) {
            (_, None) => true,
            (Some(a), Some(b)) => a == b,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(iface) => write!(f, "{}/{}/{}", self.tenant, self.node, iface),
            None => write!(f, "{}/{}", self.tenant, self.node),
        }
    }
}

/// Match fields of a physical flow entry.
///
/// Only the fields the overlay compiler emits; unset fields wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    /// Ingress port on the owning switch.
    pub in_port: Option<u32>,
    /// Source MAC address.
    pub dl_src: Option<MacAddr>,
    /// Destination MAC address.
    pub dl_dst: Option<MacAddr>,
    /// VLAN id (0 = untagged).
    pub vlan: Option<u16>,
}

impl FlowMatch {
    pub fn in_port(port: u32) -> Self {
        Self {
            in_port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_dl_src(mut self, mac: MacAddr) -> Self {
        self.dl_src = Some(mac);
        self
    }

    pub fn with_dl_dst(mut self, mac: MacAddr) -> Self {
        self.dl_dst = Some(mac);
        self
    }

    pub fn with_vlan(mut self, vlan: u16) -> Self {
        self.vlan = Some(vlan);
        self
    }
}

/// Actions applied by a physical flow entry.
///
/// Actions are deliberately excluded from entry identity: the underlying
/// switch driver may re-encode them (e.g. VLAN-priority rewrites), and a
/// cosmetically different duplicate must still be recognized as the same
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowAction {
    /// Forward out of the given port.
    Output(u32),
    /// Rewrite the VLAN tag.
    SetVlan(u16),
    /// Strip the VLAN tag.
    PopVlan,
    /// Rewrite the destination MAC.
    SetDlDst(MacAddr),
}

/// One physical flow entry: a match/action rule on a specific switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Cluster node owning the switch this entry is installed on.
    pub node: NodeId,
    /// Flow-table priority.
    pub priority: u16,
    /// Match fields.
    pub matching: FlowMatch,
    /// Action list, in order.
    pub actions: Vec<FlowAction>,
}

impl FlowEntry {
    pub fn new(node: NodeId, priority: u16, matching: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            node,
            priority,
            matching,
            actions,
        }
    }

    /// Identity of this entry for conflict and duplicate detection.
    pub fn identity(&self) -> FlowEntryId {
        FlowEntryId {
            node: self.node,
            priority: self.priority,
            matching: self.matching.clone(),
        }
    }

    /// Ports on the owning switch this entry references, either as the
    /// ingress match or as an output action.
    pub fn references_port(&self, port: u32) -> bool {
        if self.matching.in_port == Some(port) {
            return true;
        }
        self.actions
            .iter()
            .any(|a| matches!(a, FlowAction::Output(p) if *p == port))
    }
}

/// Identity of a physical flow entry: `(node, priority, match)`.
///
/// Two entries with the same identity occupy the same flow-table slot
/// regardless of their actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowEntryId {
    pub node: NodeId,
    pub priority: u16,
    pub matching: FlowMatch,
}

/// Locality of a flow entry's owning node relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// Owned by the local node; installed via the local flow API.
    Local,
    /// Owned by a live peer; must be relayed over the event channel.
    Remote,
    /// Owner is not a current cluster member; the whole task fails fast.
    Disconnected,
}
