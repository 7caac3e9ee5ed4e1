//! Named Locks
//!
//! A registry of reusable mutexes keyed by value. Two handles obtained
//! for equal keys share one mutex, so independent extraction sessions can
//! serialize on the same logical resource (a batch id, a request id)
//! without a central lock table.
//!
//! Each slot counts the handles that reference it. A slot whose count has
//! dropped to zero is removed by the next sweep; sweeps run every
//! `SWEEP_INTERVAL` acquisitions or on demand.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Acquisitions between automatic sweeps
const SWEEP_INTERVAL: u64 = 256;

static GLOBAL: LazyLock<Arc<LockRegistry<String>>> = LazyLock::new(LockRegistry::new);

struct Slot {
    mutex: Arc<Mutex<()>>,
    handles: usize,
}

/// Registry of mutexes keyed by value
pub struct LockRegistry<K: Eq + Hash + Clone> {
    slots: DashMap<K, Slot>,
    acquisitions: AtomicU64,
}

impl LockRegistry<String> {
    /// Process-wide registry keyed by strings
    pub fn global() -> Arc<LockRegistry<String>> {
        Arc::clone(&GLOBAL)
    }
}

impl<K: Eq + Hash + Clone> LockRegistry<K> {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            acquisitions: AtomicU64::new(0),
        })
    }

    /// Get the lock handle for a key
    pub fn acquire(self: &Arc<Self>, key: K) -> NamedMutex<K> {
        let mutex = {
            let mut slot = self.slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                handles: 0,
            });
            slot.handles += 1;
            Arc::clone(&slot.mutex)
        };

        let count = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_INTERVAL == 0 {
            self.sweep();
        }

        NamedMutex {
            key,
            mutex,
            registry: Arc::clone(self),
        }
    }

    /// Remove slots no handle refers to. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.handles > 0);
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            tracing::trace!("Swept {} idle lock slots", removed);
        }
        removed
    }

    /// Number of slots currently in the table, idle ones included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, key: &K) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.handles = slot.handles.saturating_sub(1);
        }
    }
}

/// Handle on the mutex for one key
pub struct NamedMutex<K: Eq + Hash + Clone> {
    key: K,
    mutex: Arc<Mutex<()>>,
    registry: Arc<LockRegistry<K>>,
}

impl<K: Eq + Hash + Clone> NamedMutex<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Block until the lock is held
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    /// Take the lock if it is free
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock()
    }

    /// Wait up to `timeout` for the lock
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock_for(timeout)
    }
}

impl<K: Eq + Hash + Clone> Drop for NamedMutex<K> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_equal_keys_share_mutex() {
        let registry = LockRegistry::<String>::new();
        let a = registry.acquire("batch-1".to_string());
        let b = registry.acquire(String::from("batch-1"));

        let _held = a.lock();
        assert!(b.try_lock().is_none());
        assert!(b.try_lock_for(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let registry = LockRegistry::<i64>::new();
        let a = registry.acquire(1);
        let b = registry.acquire(2);

        let _held = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn test_lock_released_on_guard_drop() {
        let registry = LockRegistry::<i64>::new();
        let a = registry.acquire(7);
        let b = registry.acquire(7);
        {
            let _held = a.lock();
        }
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn test_sweep_removes_unreferenced_slots() {
        let registry = LockRegistry::<i64>::new();
        let kept = registry.acquire(1);
        {
            let _dropped = registry.acquire(2);
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(kept.key(), &1);

        drop(kept);
        registry.sweep();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_serializes_threads() {
        let registry = LockRegistry::<String>::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let named = registry.acquire("same".to_string());
                    let _held = named.lock();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        registry.sweep();
        assert!(registry.is_empty());
    }
}
