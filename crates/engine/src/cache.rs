//! Process-wide memoisation of per-workflow results, keyed by `(id, version)`.
//!
//! Workflow definitions are immutable per version, so the cache never looks at
//! content. Storing a new version of a workflow drops every other cached
//! version of it; otherwise entries live until explicitly invalidated or
//! evicted.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

type Key = (String, String);

pub struct VersionCache<T> {
    entries: DashMap<Key, Arc<T>>,
}

impl<T> Default for VersionCache<T> {
    fn default() -> Self {
        Self { entries: DashMap::new() }
    }
}

impl<T> fmt::Debug for VersionCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<T> VersionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str, version: &str) -> Option<Arc<T>> {
        self.entries
            .get(&(id.to_owned(), version.to_owned()))
            .map(|entry| entry.value().clone())
    }

    /// Store `value` for `(id, version)`, replacing older versions of `id`.
    pub fn insert(&self, id: &str, version: &str, value: Arc<T>) {
        let superseded = self.entries.len();
        self.entries.retain(|(cached_id, cached_version), _| {
            cached_id != id || cached_version == version
        });
        let superseded = superseded - self.entries.len();
        if superseded > 0 {
            debug!(workflow_id = id, version, superseded, "dropped cached results for older versions");
        }
        self.entries.insert((id.to_owned(), version.to_owned()), value);
    }

    /// Remove one version. Returns whether anything was cached for it.
    pub fn invalidate(&self, id: &str, version: &str) -> bool {
        self.entries
            .remove(&(id.to_owned(), version.to_owned()))
            .is_some()
    }

    /// Remove every cached version of a workflow. Returns how many were removed.
    pub fn evict_workflow(&self, id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(cached_id, _), _| cached_id != id);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert_and_miss_after_invalidate() {
        let cache: VersionCache<u32> = VersionCache::new();
        cache.insert("wf", "1", Arc::new(7));

        assert_eq!(cache.get("wf", "1").as_deref(), Some(&7));
        assert!(cache.get("wf", "2").is_none());
        assert!(cache.invalidate("wf", "1"));
        assert!(!cache.invalidate("wf", "1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn new_version_supersedes_old_one_for_same_workflow_only() {
        let cache: VersionCache<&str> = VersionCache::new();
        cache.insert("wf", "1", Arc::new("old"));
        cache.insert("other", "1", Arc::new("untouched"));
        cache.insert("wf", "2", Arc::new("new"));

        assert!(cache.get("wf", "1").is_none());
        assert_eq!(cache.get("wf", "2").as_deref(), Some(&"new"));
        assert_eq!(cache.get("other", "1").as_deref(), Some(&"untouched"));
    }

    #[test]
    fn evict_workflow_and_clear() {
        let cache: VersionCache<u8> = VersionCache::new();
        cache.insert("a", "1", Arc::new(1));
        cache.insert("b", "1", Arc::new(2));

        assert_eq!(cache.evict_workflow("a"), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
