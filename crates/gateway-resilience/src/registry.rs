//! Lazily populated map of per-provider instances.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Map from provider id to a shared instance, created on first use
#[derive(Debug)]
pub struct KeyedRegistry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for KeyedRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> KeyedRegistry<T> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing instance for `key`, if any
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().get(key).cloned()
    }

    /// Instance for `key`, calling `create` at most once per key
    pub fn get_or_create<F>(&self, key: &str, create: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let mut entries = self.entries.write();
        // Another caller may have won the race for the write lock
        if let Some(existing) = entries.get(key) {
            return existing.clone();
        }

        let created = Arc::new(create());
        entries.insert(key.to_string(), created.clone());
        created
    }

    /// All entries, sorted by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<T>)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
