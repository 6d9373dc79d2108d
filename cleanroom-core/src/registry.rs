//! Single typed in-memory registry with a narrow API.
//!
//! `spec.md` §9 flags the teacher's "ad-hoc mutex-guarded maps spread
//! across packages" for consolidation into one typed registry type reused
//! everywhere a `sandbox_id -> T` or `ScopeKey -> T` map is needed (the
//! sandbox table, the execution table within a sandbox, the gateway scope
//! registry). Holders of the lock only ever do map operations while
//! holding it, per `spec.md` §5's shared-state discipline.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A mutex-guarded `K -> V` map exposing only `insert_unique`/`get`/`remove`/`list`.
#[derive(Debug)]
pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` at `key`, failing if `key` is already present.
    ///
    /// Returns `false` without modifying the map if `key` is occupied.
    pub fn insert_unique(&self, key: K, value: V) -> bool {
        let mut guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, value);
        true
    }

    /// Inserts `value` at `key`, overwriting any existing entry.
    pub fn replace(&self, key: K, value: V) {
        let mut guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(key, value);
    }

    /// Returns a clone of the value at `key`, if present.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(key).cloned()
    }

    /// Removes and returns the value at `key`, if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(key)
    }

    /// Returns a clone of every value currently registered.
    #[must_use]
    pub fn list(&self) -> Vec<V> {
        let guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.values().cloned().collect()
    }

    /// Number of entries currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.len()
    }

    /// Whether the registry currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_unique_rejects_duplicate_key() {
        let reg: Registry<String, i32> = Registry::new();
        assert!(reg.insert_unique("a".to_owned(), 1));
        assert!(!reg.insert_unique("a".to_owned(), 2));
        assert_eq!(reg.get(&"a".to_owned()), Some(1));
    }

    #[test]
    fn remove_returns_and_clears_entry() {
        let reg: Registry<String, i32> = Registry::new();
        reg.insert_unique("a".to_owned(), 1);
        assert_eq!(reg.remove(&"a".to_owned()), Some(1));
        assert_eq!(reg.get(&"a".to_owned()), None);
    }

    #[test]
    fn list_returns_all_values() {
        let reg: Registry<String, i32> = Registry::new();
        reg.insert_unique("a".to_owned(), 1);
        reg.insert_unique("b".to_owned(), 2);
        let mut values = reg.list();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
    }
}
