//! Reader-writer sharing for a trie used across threads.
//!
//! A bare [`CountedTrie`] is not safe for concurrent mutation. This wrapper
//! serialises writers behind one lock and lets readers run concurrently;
//! batched operations prepare their work outside the lock and acquire it
//! exactly once.

use std::sync::{RwLock, RwLockReadGuard};

use super::CountedTrie;
use crate::addr::Cidr;

pub struct SharedTrie {
    inner: RwLock<CountedTrie>,
}

impl SharedTrie {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CountedTrie::new()),
        }
    }

    pub fn insert(&self, addr: u32) {
        self.inner.write().unwrap().insert(addr);
    }

    pub fn remove(&self, addr: u32) -> bool {
        self.inner.write().unwrap().remove(addr)
    }

    /// Sort the batch outside the lock, then apply it under a single write
    /// acquisition.
    pub fn insert_batch(&self, addrs: &mut [u32]) {
        if addrs.is_empty() {
            return;
        }
        addrs.sort_unstable();
        self.inner.write().unwrap().insert_sorted_batch(addrs);
    }

    /// Remove a batch under a single write acquisition.
    pub fn remove_batch(&self, addrs: &[u32]) {
        if addrs.is_empty() {
            return;
        }
        let mut trie = self.inner.write().unwrap();
        for &a in addrs {
            trie.remove(a);
        }
    }

    pub fn count(&self, addr: u32) -> u32 {
        self.inner.read().unwrap().count(addr)
    }

    pub fn count_in_range(&self, cidr: &Cidr) -> u32 {
        self.inner.read().unwrap().count_in_range(cidr)
    }

    pub fn count_all(&self) -> u32 {
        self.inner.read().unwrap().count_all()
    }

    pub fn reset(&self) {
        self.inner.write().unwrap().reset();
    }

    /// Read access for traversals (e.g. the cluster collector). Holds the
    /// read lock for the guard's lifetime.
    pub fn read(&self) -> RwLockReadGuard<'_, CountedTrie> {
        self.inner.read().unwrap()
    }
}

impl Default for SharedTrie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_batched_writers_agree_on_totals() {
        let trie = Arc::new(SharedTrie::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let trie = Arc::clone(&trie);
            handles.push(thread::spawn(move || {
                let mut batch: Vec<u32> = (0..500).map(|i| (t << 16) | i).collect();
                trie.insert_batch(&mut batch);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(trie.count_all(), 2000);
        assert!(trie.read().check_counts());
    }

    #[test]
    fn readers_see_consistent_snapshots() {
        let trie = Arc::new(SharedTrie::new());
        let mut batch: Vec<u32> = (0..100).map(|i| 0x0A000000 | i).collect();
        trie.insert_batch(&mut batch);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let trie = Arc::clone(&trie);
                thread::spawn(move || trie.count_in_range(&"10.0.0.0/24".parse().unwrap()))
            })
            .collect();
        for r in readers {
            assert_eq!(r.join().unwrap(), 100);
        }
    }

    #[test]
    fn remove_batch_is_a_single_pass() {
        let trie = SharedTrie::new();
        let mut batch: Vec<u32> = vec![1, 2, 3, 4];
        trie.insert_batch(&mut batch);
        trie.remove_batch(&[2, 3, 99]);
        assert_eq!(trie.count_all(), 2);
    }
}
