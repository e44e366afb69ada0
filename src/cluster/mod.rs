//! Cluster membership view, event channel, and remote flow-mod relay.

pub mod events;
pub mod relay;
pub mod view;

pub use events::{ClusterEvent, ClusterEventChannel, FlowModOp, FlowModRequest, FlowModResultEvent};
pub use relay::FlowRelay;
pub use view::{ClusterView, MembershipSnapshot};
