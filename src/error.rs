//! Error types for the flow-commit protocol.

use thiserror::Error;

use crate::flow::group::FlowGroupId;
use crate::types::NodeId;

/// Result type alias for flow-commit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the flow-commit protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster cache transaction errors.
    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    /// A different flow group already owns this ingress identity.
    #[error("ingress conflict: entry already registered by group {existing}")]
    IngressConflict { existing: FlowGroupId },

    /// A flow was submitted without any entries.
    #[error("flow group {0} has no entries")]
    EmptyFlow(FlowGroupId),

    /// The ingress entry is not owned by the local cluster node.
    #[error("ingress entry of group {group} is owned by node {owner}, not local")]
    IngressNotLocal { group: FlowGroupId, owner: NodeId },

    /// The local installer rejected a flow entry.
    #[error("installer rejected entry on node {node}: {reason}")]
    InstallRejected { node: NodeId, reason: String },

    /// Posting an event on the cluster channel failed.
    #[error("event channel post to node {node} failed: {reason}")]
    ChannelPost { node: NodeId, reason: String },

    /// Serialization error on the event channel.
    #[error("event serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The service is shutting down, no new tasks accepted.
    #[error("service shutting down")]
    ShuttingDown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Cluster cache transaction errors.
#[derive(Error, Debug)]
pub enum TxnError {
    /// Beginning the transaction failed; the unit of work was never invoked.
    #[error("transaction begin failed: {0}")]
    BeginFailed(String),

    /// Commit hit a version conflict after the unit of work completed.
    #[error("transaction commit conflict: store advanced from version {expected}")]
    CommitConflict { expected: u64 },

    /// Commit failed for a non-conflict reason (store closed, infrastructure).
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    /// The configured transaction timeout elapsed before a commit landed.
    #[error("transaction timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
