//! Per-instance mutual exclusion.
//!
//! Client mutations and fabric listeners serialize on the instance id they
//! touch; unrelated instances never contend. Locks are created on first
//! use through an atomic get-or-create on a concurrent map.

use crate::instance::InstanceGuid;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of one mutex per instance id.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: DashMap<InstanceGuid, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, guid: InstanceGuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(guid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Run `f` while holding the lock for `guid`.
    ///
    /// A panic in an earlier holder does not poison the instance; the
    /// protected state lives in the stores, not in the mutex.
    pub fn with_lock<R>(&self, guid: InstanceGuid, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(guid);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drop lock entries nobody currently holds a handle to.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Number of lock entries currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no lock entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_with_lock_returns_value() {
        let locks = InstanceLocks::new();
        let guid = InstanceGuid::generate();
        assert_eq!(locks.with_lock(guid, || 7), 7);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_same_id_reuses_lock() {
        let locks = InstanceLocks::new();
        let guid = InstanceGuid::generate();
        locks.with_lock(guid, || ());
        locks.with_lock(guid, || ());
        assert_eq!(locks.len(), 1);
        locks.with_lock(InstanceGuid::generate(), || ());
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_prune_releases_idle_entries() {
        let locks = InstanceLocks::new();
        for _ in 0..5 {
            locks.with_lock(InstanceGuid::generate(), || ());
        }
        assert_eq!(locks.prune(), 5);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_serializes_same_instance() {
        let locks = Arc::new(InstanceLocks::new());
        let guid = InstanceGuid::generate();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock(guid, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
