use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-user critical sections. Every mutation of a user's subscription or
/// ledger holds that user's guard for its whole unit of work; different users
/// proceed fully in parallel.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        UserLocks {
            locks: DashMap::new(),
        }
    }

    pub async fn acquire(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Drops slots nobody currently holds so the table does not grow one entry
    /// per user for the life of the process. Guards and in-flight acquires hold
    /// a clone of the Arc, so a strong count of one means the map owns the only
    /// reference and the slot can go; `retain` holds the shard lock, keeping
    /// the check and the removal atomic against `acquire`.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }
}
