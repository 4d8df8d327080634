//! Per-key exclusive scopes.
//!
//! Each key gets its own async mutex. The map only holds weak references,
//! so a key's mutex lives exactly as long as someone holds or awaits it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune dead entries once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = self.slot(key);
        mutex.lock_owned().await
    }

    fn slot(&self, key: K) -> Arc<AsyncMutex<()>> {
        // The map is only touched inside this function, never across an
        // await, so a poisoned guard still holds consistent data.
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = slots.get(&key).and_then(Weak::upgrade) {
            return existing;
        }

        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, weak| weak.strong_count() > 0);
        }

        let fresh = Arc::new(AsyncMutex::new(()));
        slots.insert(key, Arc::downgrade(&fresh));
        fresh
    }

    /// Number of keys currently tracked, including not yet pruned ones.
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(7).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let locks = KeyedLocks::<&'static str>::new();
        {
            let _g = locks.lock("k").await;
        }
        let again = tokio::time::timeout(Duration::from_millis(100), locks.lock("k")).await;
        assert!(again.is_ok());
    }
}
