//! Auxiliary caches the optimization cycle can trim.
//!
//! The optimizer only knows the [`TrimmableCache`] interface; the host
//! registers whatever caches it wants swept. [`ItemViewCache`] is the bounded
//! item-to-view cache: an explicit LRU with an invalidation API instead of a
//! weak-reference map, so entry lifetimes are deterministic rather than
//! collector-driven.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// A cache the optimization cycle may shrink.
pub trait TrimmableCache: Send + Sync {
    /// Drop low-value entries. `aggressive` is set during an emergency pass.
    /// Returns the number of entries removed.
    fn trim(&self, aggressive: bool) -> usize;

    /// Drop everything (teardown hook).
    fn clear(&self);

    /// Current entry count.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded LRU cache mapping a data item to its view representative.
///
/// `get` promotes the entry; insertion beyond capacity evicts the LRU tail.
/// A normal trim halves the cache; an aggressive trim keeps only the most
/// recent quarter.
pub struct ItemViewCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
    name: &'static str,
}

impl<K: Hash + Eq, V: Clone> ItemViewCache<K, V> {
    /// Create a cache holding at most `capacity` entries (floored at 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity floored at 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            name,
        }
    }

    /// Look up a view, promoting it to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    /// Insert or replace a view. Returns the evicted LRU entry's value when
    /// the cache was full.
    pub fn insert(&self, key: K, view: V) -> Option<V> {
        let mut entries = self.entries.lock();
        let at_capacity = entries.len() == entries.cap().get() && !entries.contains(&key);
        let evicted = if at_capacity {
            entries.pop_lru().map(|(_, view)| view)
        } else {
            None
        };
        entries.put(key, view);
        evicted
    }

    /// Look up a view or build and cache it.
    pub fn get_or_insert_with(&self, key: K, build: impl FnOnce() -> V) -> V {
        self.entries.lock().get_or_insert(key, build).clone()
    }

    /// Drop one entry (the item changed or vanished). Returns the removed
    /// view, if present.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.entries.lock().pop(key)
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }
}

impl<K: Hash + Eq + Send, V: Clone + Send> TrimmableCache for ItemViewCache<K, V> {
    fn trim(&self, aggressive: bool) -> usize {
        let mut entries = self.entries.lock();
        let len = entries.len();
        let keep = if aggressive { len / 4 } else { len / 2 };
        let dropped = len - keep;
        for _ in 0..dropped {
            entries.pop_lru();
        }
        if dropped > 0 {
            log::debug!(
                "Trimmed {dropped} entries from {} cache ({} kept)",
                self.name,
                keep
            );
        }
        dropped
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for ItemViewCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemViewCache")
            .field("name", &self.name)
            .field("len", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}
