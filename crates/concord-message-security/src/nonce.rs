//! Bounded, FIFO-evicting cache of recently seen nonces, used to reject
//! replayed messages.

use indexmap::IndexSet;
use parking_lot::Mutex;

/// A capped set of nonces with FIFO eviction once full.
pub struct NonceCache {
    capacity: usize,
    seen: Mutex<IndexSet<String>>,
}

impl NonceCache {
    /// Create a cache holding at most `capacity` nonces.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new(IndexSet::new()),
        }
    }

    /// Whether `nonce` has already been recorded.
    pub fn is_nonce_used(&self, nonce: &str) -> bool {
        self.seen.lock().contains(nonce)
    }

    /// Record `nonce` as used, evicting the oldest entry if the cache is at
    /// capacity. Returns `false` without inserting if the nonce was already
    /// present.
    pub fn mark_nonce_used(&self, nonce: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(nonce) {
            return false;
        }
        if seen.len() >= self.capacity {
            seen.shift_remove_index(0);
        }
        seen.insert(nonce.to_string());
        true
    }

    /// Current number of recorded nonces.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_detects_reuse() {
        let cache = NonceCache::new(10);
        assert!(!cache.is_nonce_used("a"));
        assert!(cache.mark_nonce_used("a"));
        assert!(cache.is_nonce_used("a"));
        assert!(!cache.mark_nonce_used("a"));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = NonceCache::new(2);
        cache.mark_nonce_used("a");
        cache.mark_nonce_used("b");
        cache.mark_nonce_used("c");

        assert!(!cache.is_nonce_used("a"));
        assert!(cache.is_nonce_used("b"));
        assert!(cache.is_nonce_used("c"));
        assert_eq!(cache.len(), 2);
    }
}
