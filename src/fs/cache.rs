//! Directory listing cache / 目录列表缓存

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::path::TosPath;
use crate::storage::ObjectInfo;

struct CacheEntry {
    entries: Vec<ObjectInfo>,
    created: Instant,
}

/// TTL cache of listings keyed by directory path / 按目录缓存列表结果
pub struct DirCache {
    inner: RwLock<HashMap<String, CacheEntry>>,
    /// None keeps entries until invalidated / 为空表示不过期
    ttl: Option<Duration>,
    max_paths: usize,
    enabled: bool,
}

impl DirCache {
    pub fn new(ttl: Option<Duration>, max_paths: usize, enabled: bool) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
            max_paths: max_paths.max(1),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 1, false)
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        self.ttl.map_or(true, |ttl| entry.created.elapsed() < ttl)
    }

    pub fn get(&self, path: &str) -> Option<Vec<ObjectInfo>> {
        if !self.enabled {
            return None;
        }
        {
            let cache = self.inner.read();
            match cache.get(path) {
                Some(entry) if self.is_fresh(entry) => return Some(entry.entries.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.evict_stale(path)
    }

    /// Evict `path` only if it is still stale under the write lock / 写锁下确认过期后淘汰
    fn evict_stale(&self, path: &str) -> Option<Vec<ObjectInfo>> {
        let mut cache = self.inner.write();
        match cache.get(path) {
            Some(entry) if self.is_fresh(entry) => Some(entry.entries.clone()),
            Some(_) => {
                cache.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, path: &str, entries: Vec<ObjectInfo>) {
        if !self.enabled {
            return;
        }
        let mut cache = self.inner.write();
        cache.insert(
            path.to_string(),
            CacheEntry {
                entries,
                created: Instant::now(),
            },
        );
        while cache.len() > self.max_paths {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.created)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    cache.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Find a path in the cached listing of its parent / 从父目录缓存中查找
    pub fn lookup(&self, path: &TosPath) -> Option<ObjectInfo> {
        if path.is_root() {
            return None;
        }
        let name = path.to_string();
        self.get(&path.parent().to_string())?
            .into_iter()
            .find(|info| info.name == name)
    }

    /// Drop a path and every ancestor / 清除路径及其祖先
    pub fn invalidate(&self, path: &TosPath) {
        let mut cache = self.inner.write();
        for ancestor in path.ancestors() {
            cache.remove(&ancestor.to_string());
        }
    }

    /// Drop a path, its ancestors and all cached descendants / 清除整棵子树
    pub fn invalidate_tree(&self, path: &TosPath) {
        self.invalidate(path);
        let root = path.to_string();
        if root.is_empty() {
            self.clear();
            return;
        }
        let prefix = format!("{}/", root);
        self.inner.write().retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<ObjectInfo> {
        names.iter().map(|n| ObjectInfo::file(*n, 1)).collect()
    }

    #[test]
    fn test_get_put_and_lookup() {
        let cache = DirCache::new(None, 16, true);
        cache.put("bucket/dir", listing(&["bucket/dir/a", "bucket/dir/b"]));

        assert_eq!(cache.get("bucket/dir").unwrap().len(), 2);
        let hit = cache.lookup(&TosPath::parse("bucket/dir/b")).unwrap();
        assert_eq!(hit.name, "bucket/dir/b");
        assert!(cache.lookup(&TosPath::parse("bucket/dir/c")).is_none());
        assert!(cache.lookup(&TosPath::parse("bucket/other/a")).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = DirCache::new(Some(Duration::from_millis(20)), 16, true);
        cache.put("bucket", listing(&["bucket/a"]));
        assert!(cache.get("bucket").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("bucket").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_eviction_keeps_fresh_put() {
        let cache = DirCache::new(Some(Duration::from_millis(20)), 16, true);
        cache.put("bucket", listing(&["bucket/old"]));
        std::thread::sleep(Duration::from_millis(40));
        // a put landing between the read miss and the eviction survives
        cache.put("bucket", listing(&["bucket/new"]));
        let kept = cache.evict_stale("bucket").unwrap();
        assert_eq!(kept[0].name, "bucket/new");
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.evict_stale("bucket").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_ancestors() {
        let cache = DirCache::new(None, 16, true);
        for p in ["", "bucket", "bucket/a", "bucket/a/b", "bucket/c"] {
            cache.put(p, Vec::new());
        }
        cache.invalidate(&TosPath::parse("bucket/a/b/file"));
        assert!(cache.get("bucket/a/b").is_none());
        assert!(cache.get("bucket/a").is_none());
        assert!(cache.get("bucket").is_none());
        assert!(cache.get("").is_none());
        assert!(cache.get("bucket/c").is_some());
    }

    #[test]
    fn test_invalidate_tree() {
        let cache = DirCache::new(None, 16, true);
        for p in ["bucket", "bucket/a", "bucket/a/b", "bucket/ab"] {
            cache.put(p, Vec::new());
        }
        cache.invalidate_tree(&TosPath::parse("bucket/a"));
        assert!(cache.get("bucket/a/b").is_none());
        assert!(cache.get("bucket").is_none());
        assert!(cache.get("bucket/ab").is_some());
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = DirCache::new(None, 2, true);
        cache.put("bucket/1", Vec::new());
        std::thread::sleep(Duration::from_millis(2));
        cache.put("bucket/2", Vec::new());
        std::thread::sleep(Duration::from_millis(2));
        cache.put("bucket/3", Vec::new());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("bucket/1").is_none());
        assert!(cache.get("bucket/3").is_some());
    }

    #[test]
    fn test_disabled() {
        let cache = DirCache::disabled();
        cache.put("bucket", listing(&["bucket/a"]));
        assert!(cache.get("bucket").is_none());
    }
}
