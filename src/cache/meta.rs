//! Bounded LRU maps for remote metadata, keyed by normalized remote path.
//!
//! Two instances exist: `attributes` (path → [`AttrEntry`]) and
//! `directories` (path → child names). Both share the same mechanics:
//! `get` promotes to most-recent, `put` inserts at most-recent and evicts
//! the least-recent entry once the capacity is reached.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::sftp::RemoteAttr;

/// Capacity of each metadata cache.
pub const META_CAPACITY: usize = 1 << 18;

/// A cached `lstat` result. `Missing` is the negative-lookup sentinel: it
/// means the server told us the path does not exist, which is different
/// from the path not being cached at all. Callers translate `Missing` into
/// `ENOENT` without touching the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrEntry {
    Present(RemoteAttr),
    Missing,
}

pub struct MetaCache<V> {
    inner: Mutex<LruCache<String, V>>,
}

impl<V: Clone> MetaCache<V> {
    pub fn new() -> Self {
        Self::with_capacity(META_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch and promote.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert at the most-recent end, evicting the least-recent entry when
    /// full.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.inner.lock().put(key.into(), value);
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Cheap clone of the current contents, for the updater's periodic
    /// sweep. Order is unspecified.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<V: Clone> Default for MetaCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_promotes_and_put_evicts_least_recent() {
        let cache: MetaCache<u32> = MetaCache::with_capacity(2);
        cache.put("/a", 1);
        cache.put("/b", 2);
        // Promote /a; /b becomes the eviction candidate.
        assert_eq!(cache.get("/a"), Some(1));
        cache.put("/c", 3);
        assert_eq!(cache.get("/b"), None);
        assert_eq!(cache.get("/a"), Some(1));
        assert_eq!(cache.get("/c"), Some(3));
    }

    #[test]
    fn missing_sentinel_is_distinct_from_uncached() {
        let cache: MetaCache<AttrEntry> = MetaCache::with_capacity(8);
        assert_eq!(cache.get("/gone"), None);
        cache.put("/gone", AttrEntry::Missing);
        assert_eq!(cache.get("/gone"), Some(AttrEntry::Missing));
    }

    #[test]
    fn remove_and_snapshot() {
        let cache: MetaCache<u32> = MetaCache::with_capacity(8);
        cache.put("/a", 1);
        cache.put("/b", 2);
        cache.remove("/a");
        let mut snap = cache.snapshot();
        snap.sort();
        assert_eq!(snap, vec![("/b".to_string(), 2)]);
        cache.clear();
        assert!(cache.snapshot().is_empty());
    }
}
