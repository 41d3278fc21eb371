//! Keyed mutual exclusion for directory materialization.
//!
//! One lock per materialized-directory path, created on first demand
//! and dropped from the map on release. Holders keep the lock alive
//! through the `Arc`, so releasing the map entry while another thread
//! still holds the mutex is safe; late acquirers simply get a fresh
//! lock and re-run the (idempotent) existence check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct LockMap {
    mutexes: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for a key, creating it if absent. The caller locks
    /// the returned mutex.
    pub fn acquire(&self, key: &Path) -> Arc<Mutex<()>> {
        let mut mutexes = self.mutexes.lock().unwrap();
        mutexes
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map's reference so the lock is reclaimed once the last
    /// holder releases it.
    pub fn release(&self, key: &Path) {
        self.mutexes.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.mutexes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_same_key_same_lock() {
        let locks = LockMap::new();
        let a = locks.acquire(Path::new("/cache/x_dir"));
        let b = locks.acquire(Path::new("/cache/x_dir"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_keys_distinct_locks() {
        let locks = LockMap::new();
        let a = locks.acquire(Path::new("/cache/x_dir"));
        let b = locks.acquire(Path::new("/cache/y_dir"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_release_reclaims_entry() {
        let locks = LockMap::new();
        let _a = locks.acquire(Path::new("/cache/x_dir"));
        assert_eq!(locks.len(), 1);
        locks.release(Path::new("/cache/x_dir"));
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_serializes_holders() {
        let locks = Arc::new(LockMap::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let lock = locks.acquire(Path::new("/cache/x_dir"));
                    let _guard = lock.lock().unwrap();
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(5));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
