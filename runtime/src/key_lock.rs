//! Per-request lock arena.
//!
//! Every check-then-act sequence on a request (read gate state, apply or defer,
//! write) runs under that request's lock. Requests with different ids never
//! contend. Entries hold only a `Weak` reference, so an idle request costs a
//! map slot until the next sweep and nothing more.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Sweep dead entries every this many acquisitions.
const CLEANUP_INTERVAL: usize = 256;

#[derive(Debug)]
struct Slots<K> {
    locks: HashMap<K, Weak<AsyncMutex<()>>>,
    acquisitions: usize,
}

/// Arena of async mutexes keyed by `K`.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<Slots<K>>,
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                locks: HashMap::new(),
                acquisitions: 0,
            }),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyGuard {
        let mutex = self.mutex_for(&key);
        KeyGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.locks.values().filter(|weak| weak.strong_count() > 0).count()
    }

    fn mutex_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        // The std mutex only guards map bookkeeping and is never held across
        // an await. A poisoned map is still structurally valid.
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        slots.acquisitions += 1;
        if slots.acquisitions % CLEANUP_INTERVAL == 0 {
            slots.locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = slots.locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let fresh = Arc::new(AsyncMutex::new(()));
        slots.locks.insert(key.clone(), Arc::downgrade(&fresh));
        fresh
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<i64>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = locks.lock(1).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<i64>::new();
        let _first = locks.lock(1).await;

        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_not_active() {
        let locks = KeyedLocks::<i64>::new();
        {
            let _guard = locks.lock(3).await;
            assert_eq!(locks.active_keys(), 1);
        }
        assert_eq!(locks.active_keys(), 0);
    }
}
