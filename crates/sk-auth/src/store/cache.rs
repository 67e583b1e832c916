use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Process-local synchronous key-value cache.
///
/// Reads never await, so UI code that cannot suspend can use it directly.
#[derive(Default)]
pub struct LocalCache {
    entries: RwLock<HashMap<String, String>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces() {
        let cache = LocalCache::new();
        cache.set("a", "1");
        cache.set("a", "2");
        assert_eq!(cache.get("a").as_deref(), Some("2"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_prefix() {
        let cache = LocalCache::new();
        cache.set("content/p1/s1:content", "x");
        cache.set("content/p1/s2:content", "y");
        cache.set("content/p2/s1:content", "z");

        assert_eq!(cache.delete_prefix("content/p1/"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("content/p2/s1:content").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
