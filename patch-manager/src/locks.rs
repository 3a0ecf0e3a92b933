//! Per-id mutual exclusion for repository operations.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::types::PatchId;

/// Ids currently held by some operation.
#[derive(Debug, Default)]
pub struct IdLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every id is free, then hold them all.
    ///
    /// Ids are taken in sorted order so two callers locking overlapping
    /// sets cannot deadlock.
    pub fn lock<'a>(&'a self, ids: &[&PatchId]) -> IdGuard<'a> {
        let mut wanted: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        wanted.sort();
        wanted.dedup();

        let mut held = self.held_set();
        for id in &wanted {
            while held.contains(id) {
                trace!(patch_id = %id, "waiting for patch lock");
                held = self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            held.insert(id.clone());
        }
        IdGuard {
            locks: self,
            ids: wanted,
        }
    }

    pub fn is_locked(&self, id: &PatchId) -> bool {
        self.held_set().contains(id.as_str())
    }

    fn held_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its ids on drop.
#[derive(Debug)]
pub struct IdGuard<'a> {
    locks: &'a IdLocks,
    ids: Vec<String>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held_set();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let locks = IdLocks::new();
        let a = PatchId::new("a").unwrap();
        let b = PatchId::new("b").unwrap();
        {
            let _guard = locks.lock(&[&b, &a, &a]);
            assert!(locks.is_locked(&a));
            assert!(locks.is_locked(&b));
        }
        assert!(!locks.is_locked(&a));
        assert!(!locks.is_locked(&b));
    }

    #[test]
    fn same_id_is_serialized() {
        let locks = Arc::new(IdLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let id = PatchId::new("p1").unwrap();
                    let _guard = locks.lock(&[&id]);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
