use std::num::NonZeroUsize;

use lru::LruCache;
use models::{MeasurementSchema, TimeValuePair};
use parking_lot::Mutex;

/// Cached view of a remote measurement: its schema and, when known, the
/// latest value seen.
#[derive(Debug, Clone)]
pub struct CachedMeta {
    pub schema: MeasurementSchema,
    pub last: Option<TimeValuePair>,
}

impl CachedMeta {
    pub fn new(schema: MeasurementSchema) -> Self {
        Self { schema, last: None }
    }
}

/// Bounded LRU over schemas pulled from remote replica groups, keyed by
/// full measurement path. Deletions invalidate whole subtrees by prefix.
pub struct RemoteMetaCache {
    inner: Mutex<LruCache<String, CachedMeta>>,
}

impl RemoteMetaCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, full_path: &str) -> Option<CachedMeta> {
        self.inner.lock().get(full_path).cloned()
    }

    pub fn put(&self, full_path: impl Into<String>, meta: CachedMeta) {
        self.inner.lock().put(full_path.into(), meta);
    }

    /// Updates the last-value cache of an already cached path.
    pub fn update_last(&self, full_path: &str, value: TimeValuePair) {
        if let Some(meta) = self.inner.lock().get_mut(full_path) {
            match meta.last {
                Some(last) if last.timestamp >= value.timestamp => {}
                _ => meta.last = Some(value),
            }
        }
    }

    /// Drops every entry whose full path begins with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) {
        let mut cache = self.inner.lock();
        let doomed: Vec<String> = cache
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            cache.pop(&path);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(path: &str) -> CachedMeta {
        CachedMeta::new(MeasurementSchema::new(path))
    }

    #[test]
    fn test_lru_eviction() {
        let cache = RemoteMetaCache::new(2);
        cache.put("root.sg.d1.s1", meta("root.sg.d1.s1"));
        cache.put("root.sg.d1.s2", meta("root.sg.d1.s2"));
        // touch s1 so s2 is the least recent
        cache.get("root.sg.d1.s1");
        cache.put("root.sg.d1.s3", meta("root.sg.d1.s3"));

        assert!(cache.get("root.sg.d1.s1").is_some());
        assert!(cache.get("root.sg.d1.s2").is_none());
        assert!(cache.get("root.sg.d1.s3").is_some());
    }

    #[test]
    fn test_remove_prefix_drops_subtree() {
        let cache = RemoteMetaCache::new(10);
        cache.put("root.sg1.d1.s1", meta("root.sg1.d1.s1"));
        cache.put("root.sg1.d2.s1", meta("root.sg1.d2.s1"));
        cache.put("root.sg2.d1.s1", meta("root.sg2.d1.s1"));

        cache.remove_prefix("root.sg1");
        assert!(cache.get("root.sg1.d1.s1").is_none());
        assert!(cache.get("root.sg1.d2.s1").is_none());
        assert!(cache.get("root.sg2.d1.s1").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_last_keeps_newest() {
        let cache = RemoteMetaCache::new(10);
        cache.put("root.sg.d1.s1", meta("root.sg.d1.s1"));
        cache.update_last("root.sg.d1.s1", TimeValuePair::new(10, 1.0));
        cache.update_last("root.sg.d1.s1", TimeValuePair::new(5, 2.0));
        let cached = cache.get("root.sg.d1.s1").unwrap();
        assert_eq!(cached.last.unwrap().timestamp, 10);
        // an uncached path is ignored
        cache.update_last("root.sg.d9.s1", TimeValuePair::new(1, 1.0));
        assert!(cache.get("root.sg.d9.s1").is_none());
    }
}
