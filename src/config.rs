//! Configuration types for the flow-commit service.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::NodeId;

/// Default local flow-mod timeout in milliseconds.
pub const DEFAULT_LOCAL_TIMEOUT_MS: u64 = 3_000;

/// Default remote flow-mod timeout in milliseconds.
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 5_000;

/// Default remote bulk flow-mod timeout in milliseconds.
pub const DEFAULT_REMOTE_BULK_TIMEOUT_MS: u64 = 20_000;

/// Default cluster cache transaction timeout in milliseconds.
pub const DEFAULT_TXN_TIMEOUT_MS: u64 = 10_000;

/// Timeout budget for flow modification tasks.
///
/// Remote round-trips are inherently slower than local installs and get a
/// dedicated, longer deadline so they do not starve behind the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowModTimeouts {
    /// Budget for local installer calls and caller-side result waits.
    pub local: Duration,

    /// Budget for a single remote relay round-trip.
    pub remote: Duration,

    /// Budget for a bulk removal touching many flows in one relay.
    pub remote_bulk: Duration,
}

impl Default for FlowModTimeouts {
    fn default() -> Self {
        Self {
            local: Duration::from_millis(DEFAULT_LOCAL_TIMEOUT_MS),
            remote: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
            remote_bulk: Duration::from_millis(DEFAULT_REMOTE_BULK_TIMEOUT_MS),
        }
    }
}

impl FlowModTimeouts {
    /// Remote deadline for a task touching `flow_count` flows.
    pub fn remote_for(&self, flow_count: usize) -> Duration {
        if flow_count > 1 {
            self.remote_bulk
        } else {
            self.remote
        }
    }
}

/// Main configuration for the flow-commit service.
#[derive(Debug, Clone)]
pub struct FlowServiceConfig {
    /// Unique identifier for this cluster node.
    pub node_id: NodeId,

    /// Flow modification timeouts.
    pub timeouts: FlowModTimeouts,

    /// Timeout for a cluster cache transaction (begin to commit).
    pub txn_timeout: Duration,
}

impl Default for FlowServiceConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            timeouts: FlowModTimeouts::default(),
            txn_timeout: Duration::from_millis(DEFAULT_TXN_TIMEOUT_MS),
        }
    }
}

impl FlowServiceConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the local flow-mod timeout.
    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.local = timeout;
        self
    }

    /// Set the remote flow-mod timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.remote = timeout;
        self
    }

    /// Set the remote bulk flow-mod timeout.
    pub fn with_remote_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.remote_bulk = timeout;
        self
    }

    /// Set the cache transaction timeout.
    pub fn with_txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = timeout;
        self
    }

    /// Validate the configuration. Every timeout must be positive.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("local flow-mod timeout", self.timeouts.local),
            ("remote flow-mod timeout", self.timeouts.remote),
            ("remote bulk flow-mod timeout", self.timeouts.remote_bulk),
            ("transaction timeout", self.txn_timeout),
        ];
        for (name, value) in checks {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}
