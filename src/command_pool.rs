//! Process-scoped pool of shared immutable command objects.
//!
//! The shell keeps one pool per process (commands are immutable after
//! creation, so windows can share them), but the pool is an explicit
//! instance handed around at composition time, not a hidden singleton: it has
//! a defined [`clear`](CommandPool::clear) teardown hook and participates in
//! cycle trims through [`TrimmableCache`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TrimmableCache;

/// Content-addressed pool keyed by a stable descriptor. Lookups hand out
/// `Arc` handles; an entry stays alive while any handle is outstanding.
pub struct CommandPool<K: Hash + Eq, V> {
    entries: Mutex<HashMap<K, Arc<V>>>,
}

impl<K: Hash + Eq, V> CommandPool<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A shared handle to the command for `descriptor`, building it on first
    /// use.
    pub fn get_or_insert_with(&self, descriptor: K, build: impl FnOnce() -> V) -> Arc<V> {
        Arc::clone(
            self.entries
                .lock()
                .entry(descriptor)
                .or_insert_with(|| Arc::new(build())),
        )
    }

    /// A shared handle to an already-pooled command.
    pub fn get(&self, descriptor: &K) -> Option<Arc<V>> {
        self.entries.lock().get(descriptor).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop entries no caller holds a handle to (the pool's own reference is
    /// the only one). Returns the number dropped.
    pub fn trim_unreferenced(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, command| Arc::strong_count(command) > 1);
        before - entries.len()
    }

    /// Teardown hook: drop every pooled entry. Outstanding handles stay
    /// valid; the pool just stops sharing them.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<K: Hash + Eq, V> Default for CommandPool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Send, V: Send + Sync> TrimmableCache for CommandPool<K, V> {
    fn trim(&self, _aggressive: bool) -> usize {
        self.trim_unreferenced()
    }

    fn clear(&self) {
        CommandPool::clear(self);
    }

    fn len(&self) -> usize {
        CommandPool::len(self)
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for CommandPool<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
