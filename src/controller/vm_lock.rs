//! Per-VM mutual exclusion for reconciliations
//!
//! The controller runtime serializes passes of one Migration key, but two
//! Migrations naming the same VM can still run on different workers. Holding
//! the VM's lock across pod analysis and the decision that follows closes the
//! window in which both could start a target pod.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per VM currently being reconciled
#[derive(Default)]
pub struct VmLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl VmLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key` (typically `namespace/vm-name`)
    pub async fn lock(&self, key: &str) -> VmLockGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        VmLockGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of VMs with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no VM is locked or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Releases the VM lock on drop and evicts the entry once nobody holds it
pub struct VmLockGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VmLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table's own reference left: no holder, no waiter
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
