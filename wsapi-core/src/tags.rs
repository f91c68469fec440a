//! Invalidation tag index
//!
//! Maps an invalidation tag to the cache entries whose last computation
//! declared a dependency on it. The index is pure bookkeeping; the engine
//! owns it and mutates it under its state lock.

use crate::key::QueryKey;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Reverse index from tag to dependent entries
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, HashSet<QueryKey>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` under every tag in `tags`
    pub fn register(&mut self, key: &QueryKey, tags: &[String]) {
        for tag in tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Remove `key` from every tag in `tags`
    pub fn unregister(&mut self, key: &QueryKey, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    /// Swap the tag set of `key` from `old` to `new`
    pub fn replace(&mut self, key: &QueryKey, old: &[String], new: &[String]) {
        let dropped: Vec<String> = old
            .iter()
            .filter(|tag| !new.contains(tag))
            .cloned()
            .collect();
        self.unregister(key, &dropped);
        self.register(key, new);
    }

    /// Entries registered under `tag`
    pub fn entries_for(&self, tag: &str) -> impl Iterator<Item = &QueryKey> {
        self.by_tag.get(tag).into_iter().flatten()
    }

    /// Entries registered under any of `tags`, each reported once
    pub fn entries_for_any(&self, tags: &[String]) -> BTreeSet<QueryKey> {
        tags.iter()
            .flat_map(|tag| self.entries_for(tag))
            .cloned()
            .collect()
    }

    /// Number of tags with at least one dependent entry
    pub fn tag_count(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(n: i64) -> QueryKey {
        QueryKey::encode("item", &[json!(n)])
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut index = TagIndex::new();
        index.register(&key(1), &tags(&["item:1", "items"]));
        index.register(&key(2), &tags(&["item:2", "items"]));

        assert_eq!(index.entries_for("item:1").count(), 1);
        assert_eq!(index.entries_for("items").count(), 2);
        assert_eq!(index.entries_for("missing").count(), 0);
        assert_eq!(index.tag_count(), 3);
    }

    #[test]
    fn test_any_deduplicates() {
        let mut index = TagIndex::new();
        index.register(&key(1), &tags(&["a", "b"]));

        let hit = index.entries_for_any(&tags(&["a", "b", "c"]));
        assert_eq!(hit.len(), 1);
        assert!(hit.contains(&key(1)));
    }

    #[test]
    fn test_unregister_drops_empty_tags() {
        let mut index = TagIndex::new();
        index.register(&key(1), &tags(&["a"]));
        index.unregister(&key(1), &tags(&["a"]));

        assert!(index.is_empty());
        // Unregistering something unknown is harmless
        index.unregister(&key(2), &tags(&["a", "z"]));
        assert!(index.is_empty());
    }

    #[test]
    fn test_replace_removes_tags_no_longer_returned() {
        let mut index = TagIndex::new();
        index.register(&key(1), &tags(&["old", "kept"]));
        index.replace(&key(1), &tags(&["old", "kept"]), &tags(&["kept", "new"]));

        assert_eq!(index.entries_for("old").count(), 0);
        assert_eq!(index.entries_for("kept").count(), 1);
        assert_eq!(index.entries_for("new").count(), 1);
        assert_eq!(index.tag_count(), 2);
    }
}
