//! The per-mapping version cache.
//!
//! Maps logical keys to the last etag this mapping observed for them. The
//! cache is owned by exactly one mapping and mutated only through `&mut`
//! access, so it carries no internal synchronisation.

use std::collections::hash_map;
use std::collections::HashMap;

use crate::types::Etag;

/// Logical key → last known [`Etag`].
#[derive(Debug, Clone, Default)]
pub struct EtagCache {
    entries: HashMap<String, Etag>,
}

impl EtagCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last known etag for `key`, if the key is known.
    pub fn get(&self, key: &str) -> Option<&Etag> {
        self.entries.get(key)
    }

    /// Whether `key` is known.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Record `etag` as the current version of `key`.
    pub fn insert(&mut self, key: impl Into<String>, etag: Etag) {
        self.entries.insert(key.into(), etag);
    }

    /// Forget `key`.
    pub fn remove(&mut self, key: &str) -> Option<Etag> {
        self.entries.remove(key)
    }

    /// Merge a listing snapshot: listed keys take the listed etag, unlisted
    /// keys are left untouched.
    pub fn merge(&mut self, snapshot: impl IntoIterator<Item = (String, Etag)>) {
        self.entries.extend(snapshot);
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the known keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over `(key, etag)` pairs in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, String, Etag> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a EtagCache {
    type Item = (&'a String, &'a Etag);
    type IntoIter = hash_map::Iter<'a, String, Etag>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut cache = EtagCache::new();
        assert!(cache.is_empty());

        cache.insert("a", Etag::new("1"));
        assert!(cache.contains("a"));
        assert_eq!(cache.get("a"), Some(&Etag::new("1")));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.remove("a"), Some(Etag::new("1")));
        assert!(!cache.contains("a"));
        assert_eq!(cache.remove("a"), None);
    }

    #[test]
    fn test_merge_is_additive() {
        let mut cache = EtagCache::new();
        cache.insert("stale", Etag::new("1"));
        cache.insert("changed", Etag::new("1"));

        cache.merge(vec![
            ("changed".to_string(), Etag::new("2")),
            ("new".to_string(), Etag::new("3")),
        ]);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("stale"), Some(&Etag::new("1")));
        assert_eq!(cache.get("changed"), Some(&Etag::new("2")));
        assert_eq!(cache.get("new"), Some(&Etag::new("3")));
    }

    #[test]
    fn test_keys_iteration() {
        let mut cache = EtagCache::new();
        cache.insert("x", Etag::new("1"));
        cache.insert("y", Etag::new("2"));
        let mut keys: Vec<&str> = cache.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!((&cache).into_iter().count(), 2);
    }
}
