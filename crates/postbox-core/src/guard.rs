//! Per-id async locks held in a registry of weak handles.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry handing out one async mutex per id.
///
/// Entries are dropped once no task holds or waits on them.
#[derive(Debug)]
pub(crate) struct GuardRegistry<K> {
    locks: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K: Hash + Eq + Copy> GuardRegistry<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn handle(&self, id: K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(id, Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `id`.
    pub(crate) async fn lock(&self, id: K) -> OwnedMutexGuard<()> {
        self.handle(id).lock_owned().await
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let registry = Arc::new(GuardRegistry::<u64>::new());
        let guard = registry.lock(1).await;

        let other = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _guard = other.lock(1).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_ids_independent() {
        let registry = GuardRegistry::<u64>::new();
        let _a = registry.lock(1).await;
        let _b = registry.lock(2).await;
        assert_eq!(registry.live(), 2);
    }

    #[tokio::test]
    async fn test_released_entries_pruned() {
        let registry = GuardRegistry::<u64>::new();
        drop(registry.lock(1).await);
        let _b = registry.lock(2).await;
        assert_eq!(registry.live(), 1);
        assert_eq!(registry.locks.lock().unwrap().len(), 1);
    }
}
