//! Local switch flow-table capability.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::FlowEntry;

/// Installs and uninstalls flow entries on the switches owned by the
/// local cluster node.
///
/// Consumed, not owned: the implementation wraps whatever flow-table API
/// the switch driver exposes. Calls may block for a while; their duration
/// counts against the task's local timeout budget. The implementation is
/// expected to serialize its own per-switch mutations.
#[async_trait]
pub trait FlowInstaller: Send + Sync {
    /// Install one physical flow entry.
    async fn install(&self, entry: &FlowEntry) -> Result<()>;

    /// Uninstall one physical flow entry.
    async fn uninstall(&self, entry: &FlowEntry) -> Result<()>;
}
