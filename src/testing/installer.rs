//! Recording local installer with failure injection.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::installer::FlowInstaller;
use crate::types::{FlowEntry, FlowEntryId};

/// In-memory stand-in for the switch flow-table API.
///
/// Keeps the set of installed entries keyed by identity and can be told
/// to reject install or uninstall of specific entries, for exercising
/// rollback and sweep paths.
#[derive(Debug, Default)]
pub struct MockInstaller {
    entries: DashMap<FlowEntryId, FlowEntry>,
    failing: DashSet<FlowEntryId>,
    calls: AtomicU64,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any install or uninstall of the entry with this identity.
    pub fn fail_on(&self, id: FlowEntryId) {
        self.failing.insert(id);
    }

    /// Stop rejecting the entry.
    pub fn heal(&self, id: &FlowEntryId) {
        self.failing.remove(id);
    }

    /// Number of entries currently installed.
    pub fn installed_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether an entry with this identity is installed.
    pub fn contains(&self, entry: &FlowEntry) -> bool {
        self.entries.contains_key(&entry.identity())
    }

    /// Total install + uninstall calls observed.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Snapshot of installed entries.
    pub fn entries(&self) -> Vec<FlowEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl FlowInstaller for MockInstaller {
    async fn install(&self, entry: &FlowEntry) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let id = entry.identity();
        if self.failing.contains(&id) {
            return Err(Error::InstallRejected {
                node: entry.node,
                reason: "injected failure".into(),
            });
        }
        self.entries.insert(id, entry.clone());
        Ok(())
    }

    async fn uninstall(&self, entry: &FlowEntry) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let id = entry.identity();
        if self.failing.contains(&id) {
            return Err(Error::InstallRejected {
                node: entry.node,
                reason: "injected failure".into(),
            });
        }
        self.entries.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowAction, FlowMatch};

    #[tokio::test]
    async fn test_install_uninstall_roundtrip() {
        let installer = MockInstaller::new();
        let entry = FlowEntry::new(1, 10, FlowMatch::in_port(1), vec![FlowAction::Output(2)]);

        installer.install(&entry).await.unwrap();
        assert!(installer.contains(&entry));
        assert_eq!(installer.installed_count(), 1);

        installer.uninstall(&entry).await.unwrap();
        assert!(!installer.contains(&entry));
        assert_eq!(installer.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let installer = MockInstaller::new();
        let entry = FlowEntry::new(1, 10, FlowMatch::in_port(1), vec![]);

        installer.fail_on(entry.identity());
        assert!(installer.install(&entry).await.is_err());
        assert_eq!(installer.installed_count(), 0);

        installer.heal(&entry.identity());
        assert!(installer.install(&entry).await.is_ok());

        // Uninstall rejection leaves the entry in place.
        installer.fail_on(entry.identity());
        assert!(installer.uninstall(&entry).await.is_err());
        assert!(installer.contains(&entry));
    }
}
