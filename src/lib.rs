//! Distributed flow-commit protocol for virtual network overlays.
//!
//! A virtual bridge on a clustered SDN controller compiles into physical
//! flow entries spread across switches owned by different cluster nodes.
//! This crate commits such a multi-switch, multi-node flow atomically
//! enough to be useful: only the node owning a switch may program it,
//! ownership can change at any time, remote requests travel over an
//! asynchronous at-least-once event channel, and callers still get a
//! bounded-time, well-defined outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use flowmesh::{ClusterView, FlowServiceConfig, FlowService};
//! # use flowmesh::testing::{MockInstaller, TestBus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Arc::new(ClusterView::new(1));
//!     # let installer = Arc::new(MockInstaller::new());
//!     # let channel = Arc::new(TestBus::new());
//!     let service = FlowService::new(
//!         FlowServiceConfig::new(1),
//!         cluster,
//!         installer,
//!         channel,
//!     )?;
//!
//!     // Per-tenant registry of committed logical flows.
//!     let db = service.database("tenant-a");
//!     let mut flow = db.create();
//!     // ... populate flow.add_entry(..) with per-hop physical entries ...
//!
//!     let handle = db.install(flow)?;
//!     let result = handle.result(Duration::from_secs(5)).await;
//!     println!("commit outcome: {result:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 FlowService                     │
//! │  per-tenant FlowDatabase · event dispatch       │
//! └─────────────────────────────────────────────────┘
//!          │                 │                │
//!          ▼                 ▼                ▼
//! ┌──────────────┐   ┌──────────────┐  ┌───────────────┐
//! │ FlowDatabase │   │ FlowModTask  │  │  FlowRelay    │
//! │ registry +   │──▶│ ingress →    │─▶│ correlation + │
//! │ CacheTxn     │   │ local→remote │  │ event channel │
//! └──────────────┘   └──────────────┘  └───────────────┘
//! ```
//!
//! # Commit model
//!
//! - A task installs the **ingress** entry first (local switch API),
//!   then the remaining local hops, then relays one batch per remote
//!   owning node and waits, bounded by the remote timeout.
//! - Any failure, timeout, or interruption rolls the applied local
//!   entries back: a flow is either fully present in the registry or
//!   fully absent from every switch.
//! - Registry mutations that must be visible cluster-wide run inside a
//!   [`CacheTransaction`] with verdict-driven retry.

pub mod cluster;
pub mod config;
pub mod error;
pub mod flow;
pub mod installer;
pub mod service;
pub mod testing;
pub mod txn;
pub mod types;

// Re-export main types for convenience.
pub use config::{FlowModTimeouts, FlowServiceConfig};
pub use error::{Error, Result, TxnError};
pub use installer::FlowInstaller;
pub use service::FlowService;
pub use types::{
    FlowAction, FlowEntry, FlowEntryId, FlowMatch, Locality, MacAddr, MacVlan, NodeId, VirtualPath,
};

// Re-export cluster types.
pub use cluster::{
    ClusterEvent, ClusterEventChannel, ClusterView, FlowModOp, FlowModRequest, FlowModResultEvent,
    FlowRelay, MembershipSnapshot,
};

// Re-export flow types.
pub use flow::{
    FlowDatabase, FlowDatabaseStats, FlowGroupId, FlowModHandle, FlowModResult, FlowSelector,
    TaskState, VirtualFlow,
};

// Re-export transaction types.
pub use txn::{CacheTransaction, SharedMap, Transaction, TxnVerdict};
