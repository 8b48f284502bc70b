//! Per-thread provisioning guard
//!
//! At most one "create channel for this thread" operation runs at a time
//! per external thread id. Later callers wait on the same mutex and must
//! re-check the store once they hold it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Default, Clone)]
pub struct ProvisionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ProvisionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive provisioning rights on `thread_id`
    pub async fn acquire(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!("Pruned {} idle provisioning locks", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
