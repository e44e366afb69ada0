//! Transactional access to shared cluster state.
//!
//! [`SharedMap`] stands for a map replicated across the controller cluster:
//! every mutation that must be visible cluster-wide goes through a
//! begin/commit/rollback cycle. [`CacheTransaction`] wraps that cycle with
//! an explicit retry loop driven by the [`TxnVerdict`] returned from the
//! unit of work, so contention handling is a value, not control flow by
//! exception.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result, TxnError};

/// Verdict returned by a transactional unit of work.
#[derive(Debug)]
pub enum TxnVerdict<T> {
    /// Commit the staged mutations and return the value.
    Commit(T),
    /// Contention detected; roll back and run the whole cycle again.
    Retry,
    /// Business-logic abort; roll back and propagate without retry.
    Abort(Error),
}

/// A versioned map standing in for cluster-replicated shared state.
///
/// Reads go straight to the current committed state and never block
/// writers for long; mutations are staged in a [`Transaction`] and applied
/// atomically at commit, guarded by a version check.
#[derive(Debug)]
pub struct SharedMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

#[derive(Debug)]
struct MapInner<K, V> {
    state: RwLock<MapState<K, V>>,
    closed: AtomicBool,
    begin_count: AtomicU64,
}

#[derive(Debug)]
struct MapState<K, V> {
    entries: HashMap<K, V>,
    version: u64,
}

impl<K, V> Clone for SharedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for SharedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map at version 1.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MapInner {
                state: RwLock::new(MapState {
                    entries: HashMap::new(),
                    version: 1,
                }),
                closed: AtomicBool::new(false),
                begin_count: AtomicU64::new(0),
            }),
        }
    }

    /// Read a value from the committed state.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.state.read().entries.get(key).cloned()
    }

    /// Whether the committed state contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.read().entries.contains_key(key)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    /// Whether the committed state is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.state.read().entries.is_empty()
    }

    /// Snapshot of all committed values.
    pub fn values(&self) -> Vec<V> {
        self.inner.state.read().entries.values().cloned().collect()
    }

    /// Snapshot of all committed key/value pairs.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Current committed version. Bumped once per successful commit.
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Number of transactions begun against this map.
    pub fn begin_count(&self) -> u64 {
        self.inner.begin_count.load(Ordering::Relaxed)
    }

    /// Mark the map closed. Subsequent begins and commits fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Begin a transaction against the current committed version.
    pub fn begin(&self) -> std::result::Result<Transaction<K, V>, TxnError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TxnError::BeginFailed("shared map is closed".into()));
        }
        self.inner.begin_count.fetch_add(1, Ordering::Relaxed);
        let version = self.inner.state.read().version;
        Ok(Transaction {
            map: Arc::clone(&self.inner),
            begin_version: version,
            staged: HashMap::new(),
        })
    }
}

/// An open transaction: staged mutations with read-your-writes.
#[derive(Debug)]
pub struct Transaction<K, V> {
    map: Arc<MapInner<K, V>>,
    begin_version: u64,
    // None stages a removal.
    staged: HashMap<K, Option<V>>,
}

impl<K, V> Transaction<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Read through staged mutations, falling back to committed state.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.map.state.read().entries.get(key).cloned(),
        }
    }

    /// Whether the key is visible inside this transaction.
    pub fn contains_key(&self, key: &K) -> bool {
        match self.staged.get(key) {
            Some(staged) => staged.is_some(),
            None => self.map.state.read().entries.contains_key(key),
        }
    }

    /// Stage an insert or update.
    pub fn insert(&mut self, key: K, value: V) {
        self.staged.insert(key, Some(value));
    }

    /// Stage a removal.
    pub fn remove(&mut self, key: K) {
        self.staged.insert(key, None);
    }

    /// Stage removal of every committed entry (and drop staged inserts).
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.map.state.read().entries.keys().cloned().collect();
        self.staged.clear();
        for key in keys {
            self.staged.insert(key, None);
        }
    }

    /// Version the transaction was begun against.
    pub fn begin_version(&self) -> u64 {
        self.begin_version
    }

    /// Discard all staged mutations.
    pub fn rollback(self) {}

    /// Apply staged mutations atomically if the map has not advanced.
    pub fn commit(self) -> std::result::Result<(), TxnError> {
        if self.map.closed.load(Ordering::SeqCst) {
            return Err(TxnError::CommitFailed("shared map is closed".into()));
        }
        let mut state = self.map.state.write();
        if state.version != self.begin_version {
            return Err(TxnError::CommitConflict {
                expected: self.begin_version,
            });
        }
        for (key, staged) in self.staged {
            match staged {
                Some(value) => {
                    state.entries.insert(key, value);
                }
                None => {
                    state.entries.remove(&key);
                }
            }
        }
        state.version += 1;
        Ok(())
    }
}

/// Retry-capable wrapper around a transactional unit of work.
///
/// `execute` runs begin → unit-of-work → commit, retrying the whole cycle
/// with a fresh transaction whenever the unit of work reports
/// [`TxnVerdict::Retry`] or the commit hits a version conflict with a
/// concurrent writer. Retries are expected to be rare and cheap; the
/// only bound on their number is the configured timeout.
#[derive(Debug, Clone)]
pub struct CacheTransaction<K, V> {
    map: SharedMap<K, V>,
    timeout: Duration,
}

impl<K, V> CacheTransaction<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(map: SharedMap<K, V>, timeout: Duration) -> Self {
        Self { map, timeout }
    }

    /// Run the unit of work to completion.
    ///
    /// - `Commit(v)` commits the staged mutations and returns `v`.
    /// - `Retry` rolls back and starts over with a fresh transaction.
    /// - `Abort(e)` rolls back and returns `e` without retry.
    ///
    /// Begin failure propagates before the unit of work is invoked. A
    /// commit-time version conflict re-runs the cycle (writers to
    /// unrelated keys must not fail each other); any other commit
    /// failure propagates as a typed error.
    pub fn execute<T, F>(&self, mut unit: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<K, V>) -> TxnVerdict<T>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts: u32 = 0;

        loop {
            if attempts > 0 && Instant::now() >= deadline {
                return Err(Error::Txn(TxnError::Timeout { attempts }));
            }

            let mut txn = self.map.begin().map_err(Error::Txn)?;
            attempts += 1;

            match unit(&mut txn) {
                TxnVerdict::Commit(value) => match txn.commit() {
                    Ok(()) => {
                        if attempts > 1 {
                            tracing::debug!(attempts, "transaction committed after retries");
                        }
                        return Ok(value);
                    }
                    Err(TxnError::CommitConflict { .. }) => {
                        tracing::trace!(attempts, "commit conflict, retrying");
                    }
                    Err(e) => return Err(Error::Txn(e)),
                },
                TxnVerdict::Retry => {
                    txn.rollback();
                    tracing::trace!(attempts, "transaction contention, retrying");
                }
                TxnVerdict::Abort(err) => {
                    txn.rollback();
                    return Err(err);
                }
            }
        }
    }
}
