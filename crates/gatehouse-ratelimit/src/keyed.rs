//! Two-level locked map of per-key limiter state.
//!
//! Lookup and creation take the map's read-write lock; per-entry mutation is
//! serialized by the entry's own mutex. Background eviction holds the write
//! lock briefly while it retains live entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A lazily-populated map of `key -> Arc<Mutex<T>>`.
pub(crate) struct KeyedMap<T> {
    entries: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> KeyedMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for `key`, creating it with `init` if absent.
    pub(crate) fn get_or_insert_with<F>(&self, key: &str, init: F) -> Arc<Mutex<T>>
    where
        F: FnOnce() -> T,
    {
        if let Some(entry) = self.entries.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    /// Returns the entry for `key` without creating it.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(Arc::clone)
    }

    /// Removes the entry for `key`.
    pub(crate) fn remove(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Retains only the entries for which `keep` returns true.
    ///
    /// Returns the number of evicted entries.
    pub(crate) fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| {
            let state = entry.lock().unwrap_or_else(|e| e.into_inner());
            keep(&state)
        });
        before - entries.len()
    }

    /// Number of tracked keys.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_created_lazily_and_shared() {
        let map: KeyedMap<u32> = KeyedMap::new();
        assert_eq!(map.len(), 0);

        let a = map.get_or_insert_with("k", || 7);
        let b = map.get_or_insert_with("k", || 99);
        assert_eq!(map.len(), 1);
        assert_eq!(*a.lock().unwrap(), 7);
        // Second lookup must not reinitialize.
        assert_eq!(*b.lock().unwrap(), 7);
    }

    #[test]
    fn retain_evicts_and_counts() {
        let map: KeyedMap<u32> = KeyedMap::new();
        map.get_or_insert_with("a", || 1);
        map.get_or_insert_with("b", || 2);
        map.get_or_insert_with("c", || 3);

        let evicted = map.retain(|v| *v != 2);
        assert_eq!(evicted, 1);
        assert_eq!(map.len(), 2);
        assert!(map.get("b").is_none());
    }

    #[test]
    fn remove_drops_the_entry() {
        let map: KeyedMap<u32> = KeyedMap::new();
        map.get_or_insert_with("a", || 1);
        assert!(map.remove("a").is_some());
        assert!(map.remove("a").is_none());
        assert_eq!(map.len(), 0);
    }
}
