//! Filesystem over an object store / 基于对象存储的文件系统
//!
//! `TosFileSystem` maps paths of the form `bucket/key` onto objects. Buckets
//! are top-level directories, directories are common prefixes or zero-byte
//! `key/` markers. Every store call runs through the retry policy.

pub mod cache;
pub mod file;
pub mod listing;
pub mod path;
pub mod stream;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self as fstream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::FsOptions;
use crate::error::{Result, TosfsError};
use crate::retry::RetryPolicy;
use crate::storage::{
    find_by_walk, resolve_range, Capability, FileSystem, ObjectInfo, ObjectKind, ObjectMeta, ObjectStore,
    ProgressCallback,
};
use crate::utils;

use self::cache::DirCache;
use self::file::{OpenMode, TosFile};
use self::listing::DELIMITER;
use self::path::TosPath;
use self::stream::{object_reader, object_writer, UploadTarget};

/// Keys per batch delete request / 每次批量删除的键数
const DELETE_BATCH_SIZE: usize = 1000;

/// Object-store backed filesystem / 对象存储文件系统
pub struct TosFileSystem<S: ObjectStore> {
    store: Arc<S>,
    options: FsOptions,
    retry: RetryPolicy,
    cache: Arc<DirCache>,
    protocol: String,
}

impl<S: ObjectStore> TosFileSystem<S> {
    pub fn new(store: Arc<S>, options: FsOptions, retry: RetryPolicy) -> Self {
        Self::with_protocol(store, options, retry, "tos")
    }

    pub fn with_protocol(store: Arc<S>, options: FsOptions, retry: RetryPolicy, protocol: &str) -> Self {
        let ttl = options.listings_expiry_time.map(Duration::from_secs);
        let cache = DirCache::new(ttl, options.max_paths, options.listings_cache);
        Self {
            store,
            options,
            retry,
            cache: Arc::new(cache),
            protocol: protocol.to_string(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn cache(&self) -> &Arc<DirCache> {
        &self.cache
    }

    pub fn parse(&self, path: &str) -> TosPath {
        TosPath::parse(&self.normalize_path(path))
    }

    /// Part size for writes, never below the store minimum / 写入分片大小
    pub(crate) fn part_size(&self, block_size: Option<u64>) -> u64 {
        block_size
            .unwrap_or(self.options.default_block_size)
            .max(self.options.min_part_size)
            .max(1)
    }

    /// Open a file handle, `mode` is one of `rb`, `wb` / 打开文件
    pub async fn open(&self, path: &str, mode: &str, block_size: Option<u64>) -> Result<TosFile<S>> {
        match mode.parse::<OpenMode>()? {
            OpenMode::Read => TosFile::open_read(self, path, block_size).await,
            OpenMode::Write => TosFile::open_write(self, path, block_size).await,
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.retry
            .run("head_object", || self.store.head_object(bucket, key))
            .await
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.retry
            .run("bucket_exists", || self.store.bucket_exists(bucket))
            .await
    }

    /// Whether `path` is a directory: a marker or at least one key below it / 是否为目录
    pub(crate) async fn dir_exists(&self, path: &TosPath) -> Result<bool> {
        if path.is_root() {
            return Ok(true);
        }
        if path.is_bucket() {
            return self.bucket_exists(&path.bucket).await;
        }
        let dir_key = path.dir_key();
        if self.head(&path.bucket, &dir_key).await?.is_some() {
            return Ok(true);
        }
        let page = self
            .retry
            .run("list_objects", || {
                self.store
                    .list_objects(&path.bucket, &dir_key, Some(DELIMITER), None, 1)
            })
            .await?;
        Ok(!page.objects.is_empty() || !page.common_prefixes.is_empty())
    }

    /// Stat without NotFound, None when nothing is there / 查询路径信息
    async fn lookup(&self, path: &TosPath) -> Result<Option<ObjectInfo>> {
        if path.is_root() {
            return Ok(Some(ObjectInfo::directory("")));
        }
        if path.is_bucket() {
            if !self.bucket_exists(&path.bucket).await? {
                return Ok(None);
            }
            return Ok(Some(ObjectInfo::bucket(path.bucket.clone())));
        }
        if let Some(info) = self.cache.lookup(path) {
            return Ok(Some(info));
        }
        if let Some(meta) = self.head(&path.bucket, &path.key).await? {
            return Ok(Some(listing::file_info(&path.bucket, &meta)));
        }
        let dir_key = path.dir_key();
        if let Some(marker) = self.head(&path.bucket, &dir_key).await? {
            let mut info = ObjectInfo::directory(path.to_string());
            info.last_modified = marker.last_modified;
            return Ok(Some(info));
        }
        let page = self
            .retry
            .run("list_objects", || {
                self.store
                    .list_objects(&path.bucket, &dir_key, Some(DELIMITER), None, 1)
            })
            .await?;
        if !page.objects.is_empty() || !page.common_prefixes.is_empty() {
            return Ok(Some(ObjectInfo::directory(path.to_string())));
        }
        Ok(None)
    }

    /// Delete keys in batches, `max_concurrency` requests at a time / 批量删除
    async fn delete_keys(&self, bucket: &str, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let batches: Vec<Vec<String>> = keys.chunks(DELETE_BATCH_SIZE).map(|c| c.to_vec()).collect();
        tracing::debug!("Deleting {} keys from {} in {} batches", keys.len(), bucket, batches.len());
        fstream::iter(batches)
            .map(|batch| async move {
                self.retry
                    .run("delete_objects", || self.store.delete_objects(bucket, &batch))
                    .await
            })
            .buffered(self.options.max_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn copy_key(&self, src: &TosPath, dst: &TosPath) -> Result<()> {
        self.retry
            .run("copy_object", || {
                self.store
                    .copy_object(&src.bucket, &src.key, &dst.bucket, &dst.key)
            })
            .await
    }

    async fn put_marker(&self, path: &TosPath) -> Result<()> {
        let key = path.dir_key();
        self.retry
            .run("put_object", || self.store.put_object(&path.bucket, &key, Bytes::new()))
            .await
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.retry
            .run("create_bucket", || self.store.create_bucket(bucket))
            .await?;
        tracing::info!("Created bucket {}", bucket);
        self.cache.invalidate(&TosPath::default());
        Ok(())
    }

    async fn mv_file(&self, src: &TosPath, dst: &TosPath) -> Result<()> {
        match self.lookup(dst).await? {
            Some(info) if info.is_dir() => return Err(TosfsError::IsADirectory(dst.to_string())),
            _ => {}
        }
        self.copy_key(src, dst).await?;
        self.retry
            .run("delete_object", || self.store.delete_object(&src.bucket, &src.key))
            .await?;
        self.cache.invalidate(src);
        self.cache.invalidate(dst);
        Ok(())
    }

    async fn mv_dir(&self, src: &TosPath, dst: &TosPath) -> Result<()> {
        if src.bucket == dst.bucket && utils::is_sub_path(&src.key, &dst.key) {
            return Err(TosfsError::InvalidArgument(format!(
                "cannot move {} into itself at {}",
                src, dst
            )));
        }
        match self.lookup(dst).await? {
            Some(info) if info.is_file() => return Err(TosfsError::NotADirectory(dst.to_string())),
            Some(_) => {
                if !self.ls(&dst.to_string(), true).await?.is_empty() {
                    return Err(TosfsError::DirectoryNotEmpty(dst.to_string()));
                }
            }
            None => {}
        }

        let objects = listing::list_recursive(self.store.as_ref(), &self.retry, src, self.options.list_page_size).await?;
        let src_prefix = src.dir_key();
        let dst_prefix = dst.dir_key();
        let moves: Vec<(TosPath, TosPath)> = objects
            .iter()
            .filter_map(|object| {
                let rel = object.key.strip_prefix(&src_prefix)?;
                let target = format!("{}{}", dst_prefix, rel);
                if target.is_empty() {
                    return None;
                }
                Some((
                    TosPath::new(src.bucket.clone(), object.key.clone()),
                    TosPath {
                        bucket: dst.bucket.clone(),
                        key: target,
                    },
                ))
            })
            .collect();

        tracing::debug!("Moving {} objects from {} to {}", moves.len(), src, dst);
        let copies: Vec<_> = moves.iter().map(|(from, to)| self.copy_key(from, to)).collect();
        fstream::iter(copies)
            .buffer_unordered(self.options.max_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        let keys = objects.into_iter().map(|o| o.key).collect();
        self.delete_keys(&src.bucket, keys).await?;
        self.cache.invalidate_tree(src);
        self.cache.invalidate_tree(dst);
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> FileSystem for TosFileSystem<S> {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn capabilities(&self) -> Capability {
        self.store.capabilities()
    }

    fn normalize_path(&self, path: &str) -> String {
        let prefix = format!("{}://", self.protocol);
        let path = path.trim();
        path::strip_protocol(path.strip_prefix(&prefix).unwrap_or(path))
    }

    async fn ls(&self, path: &str, refresh: bool) -> Result<Vec<ObjectInfo>> {
        let target = self.parse(path);
        let cache_key = target.to_string();
        if !refresh {
            if let Some(entries) = self.cache.get(&cache_key) {
                return Ok(entries);
            }
        }

        let entries = if target.is_root() {
            listing::list_buckets(self.store.as_ref(), &self.retry).await?
        } else {
            listing::list_dir(self.store.as_ref(), &self.retry, &target, self.options.list_page_size).await?
        };

        if entries.is_empty() && !target.key.is_empty() {
            // a file lists as itself
            if let Some(meta) = self.head(&target.bucket, &target.key).await? {
                return Ok(vec![listing::file_info(&target.bucket, &meta)]);
            }
        }

        self.cache.put(&cache_key, entries.clone());
        Ok(entries)
    }

    async fn info(&self, path: &str) -> Result<ObjectInfo> {
        let normalized = self.normalize_path(path);
        if normalized.is_empty() {
            return Ok(ObjectInfo::directory(path.trim()));
        }
        let target = TosPath::parse(&normalized);
        self.lookup(&target)
            .await?
            .ok_or_else(|| TosfsError::NotFound(target.to_string()))
    }

    async fn open_reader(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let info = self.info(path).await?;
        if info.is_dir() {
            return Err(TosfsError::IsADirectory(info.name));
        }
        let range = range.unwrap_or(0..info.size);
        let range = range.start.min(info.size)..range.end.min(info.size);
        let reader = object_reader(
            self.store.clone(),
            self.retry.clone(),
            TosPath::parse(&info.name),
            range,
            self.options.default_block_size,
        );
        Ok(Box::new(reader))
    }

    async fn open_writer(
        &self,
        path: &str,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback>,
    ) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
        let target = self.parse(path);
        if target.key.is_empty() || self.dir_exists(&target).await? {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }
        let part_size = self.part_size(None) as usize;
        let writer = object_writer(
            UploadTarget {
                store: self.store.clone(),
                retry: self.retry.clone(),
                path: target,
                cache: self.cache.clone(),
                size_hint,
                progress,
            },
            part_size,
        );
        Ok(Box::new(writer))
    }

    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()> {
        let target = self.parse(path);
        if target.is_root() {
            return Err(TosfsError::InvalidPath(path.to_string()));
        }

        if !self.bucket_exists(&target.bucket).await? {
            if target.is_bucket() || create_parents {
                self.create_bucket(&target.bucket).await?;
            } else {
                return Err(TosfsError::NotFound(target.bucket.clone()));
            }
        } else if target.is_bucket() {
            return Err(TosfsError::AlreadyExists(target.to_string()));
        }
        if target.is_bucket() {
            return Ok(());
        }

        if self.lookup(&target).await?.is_some() {
            return Err(TosfsError::AlreadyExists(target.to_string()));
        }

        // ancestors below the bucket, outermost first
        let mut ancestors: Vec<TosPath> = target
            .ancestors()
            .into_iter()
            .skip(1)
            .filter(|p| !p.key.is_empty())
            .collect();
        ancestors.reverse();
        for ancestor in ancestors {
            match self.lookup(&ancestor).await? {
                Some(info) if info.is_file() => return Err(TosfsError::NotADirectory(ancestor.to_string())),
                Some(_) => {}
                None if create_parents => self.put_marker(&ancestor).await?,
                None => return Err(TosfsError::NotFound(ancestor.to_string())),
            }
        }

        self.put_marker(&target).await?;
        self.cache.invalidate(&target);
        tracing::debug!("Created directory {}", target);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let target = self.parse(path);
        if target.is_root() {
            return Err(TosfsError::InvalidPath(path.to_string()));
        }
        if target.is_bucket() {
            return Err(TosfsError::tosfs(format!(
                "Cannot remove a bucket {} using rmdir api.",
                target.bucket
            )));
        }

        let info = self
            .lookup(&target)
            .await?
            .ok_or_else(|| TosfsError::NotFound(target.to_string()))?;
        if info.is_file() {
            return Err(TosfsError::NotADirectory(target.to_string()));
        }

        let dir_key = target.dir_key();
        let page = self
            .retry
            .run("list_objects", || {
                self.store
                    .list_objects(&target.bucket, &dir_key, Some(DELIMITER), None, 2)
            })
            .await?;
        let has_children = !page.common_prefixes.is_empty() || page.objects.iter().any(|o| o.key != dir_key);
        if has_children {
            return Err(TosfsError::DirectoryNotEmpty(target.to_string()));
        }

        self.retry
            .run("delete_object", || self.store.delete_object(&target.bucket, &dir_key))
            .await?;
        self.cache.invalidate_tree(&target);
        Ok(())
    }

    async fn rm_file(&self, path: &str) -> Result<()> {
        let target = self.parse(path);
        if target.key.is_empty() {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }
        if self.head(&target.bucket, &target.key).await?.is_none() && self.dir_exists(&target).await? {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }
        self.retry
            .run("delete_object", || self.store.delete_object(&target.bucket, &target.key))
            .await?;
        self.cache.invalidate(&target);
        Ok(())
    }

    async fn rm(&self, paths: &[String], recursive: bool) -> Result<()> {
        let mut targets: BTreeMap<String, ObjectInfo> = BTreeMap::new();
        for raw in paths {
            let path = self.normalize_path(raw);
            let matched = if utils::has_magic(&path) {
                self.glob(&path).await?
            } else {
                match self.info(&path).await {
                    Ok(info) => vec![info],
                    Err(e) if e.is_not_found() && recursive => Vec::new(),
                    Err(e) => return Err(e),
                }
            };
            for info in matched {
                if recursive && info.is_dir() {
                    for child in self.find(&info.name, None, true).await? {
                        targets.insert(child.name.clone(), child);
                    }
                }
                targets.insert(info.name.clone(), info);
            }
        }

        let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dirs: Vec<TosPath> = Vec::new();
        for info in targets.values() {
            let target = TosPath::parse(&info.name);
            match info.kind {
                ObjectKind::File => files.entry(target.bucket.clone()).or_default().push(target.key.clone()),
                ObjectKind::Directory => dirs.push(target),
                ObjectKind::Bucket => tracing::debug!("rm keeps bucket {}", info.name),
            }
        }

        for (bucket, keys) in files {
            self.delete_keys(&bucket, keys).await?;
        }
        for info in targets.values().filter(|i| i.is_file()) {
            self.cache.invalidate(&TosPath::parse(&info.name));
        }

        if !recursive {
            for dir in dirs {
                self.rmdir(&dir.to_string()).await?;
            }
            return Ok(());
        }

        // markers, deepest first
        dirs.sort_by(|a, b| b.key.matches('/').count().cmp(&a.key.matches('/').count()));
        let mut markers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for dir in &dirs {
            markers.entry(dir.bucket.clone()).or_default().push(dir.dir_key());
        }
        for (bucket, keys) in markers {
            self.delete_keys(&bucket, keys).await?;
        }
        for dir in &dirs {
            self.cache.invalidate_tree(dir);
        }
        Ok(())
    }

    async fn mv(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.parse(src);
        let dst = self.parse(dst);
        if src.key.is_empty() || dst.is_root() {
            if src == dst {
                return Ok(());
            }
            return Err(TosfsError::Unsupported(format!("move {} to {}", src, dst)));
        }
        let info = self
            .lookup(&src)
            .await?
            .ok_or_else(|| TosfsError::NotFound(src.to_string()))?;
        if src == dst {
            return Ok(());
        }
        if info.is_file() {
            self.mv_file(&src, &dst).await
        } else {
            self.mv_dir(&src, &dst).await
        }
    }

    fn invalidate_cache(&self, path: Option<&str>) {
        match path {
            Some(path) => self.cache.invalidate_tree(&self.parse(path)),
            None => self.cache.clear(),
        }
    }

    /// Server-side copy / 服务端复制
    async fn cp_file(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.parse(src);
        let dst = self.parse(dst);
        if src.key.is_empty() {
            return Err(TosfsError::IsADirectory(src.to_string()));
        }
        if dst.key.is_empty() {
            return Err(TosfsError::IsADirectory(dst.to_string()));
        }
        if self.head(&src.bucket, &src.key).await?.is_none() {
            if self.dir_exists(&src).await? {
                return Err(TosfsError::IsADirectory(src.to_string()));
            }
            return Err(TosfsError::NotFound(src.to_string()));
        }
        self.copy_key(&src, &dst).await?;
        self.cache.invalidate(&dst);
        Ok(())
    }

    async fn cat_file(&self, path: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        let target = self.parse(path);
        if target.key.is_empty() {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }

        let range = match (start, end) {
            (None, None) => None,
            _ => {
                let info = self.info(path).await?;
                if info.is_dir() {
                    return Err(TosfsError::IsADirectory(info.name));
                }
                let range = resolve_range(info.size, start, end);
                if range.is_empty() {
                    return Ok(Bytes::new());
                }
                Some(range)
            }
        };

        let result = self
            .retry
            .run("get_object", || {
                self.store.get_object(&target.bucket, &target.key, range.clone())
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => {
                if self.dir_exists(&target).await? {
                    Err(TosfsError::IsADirectory(target.to_string()))
                } else {
                    Err(TosfsError::NotFound(target.to_string()))
                }
            }
            other => other,
        }
    }

    /// One flat listing instead of a walk / 一次扁平列举
    async fn find(&self, path: &str, maxdepth: Option<usize>, withdirs: bool) -> Result<Vec<ObjectInfo>> {
        let target = self.parse(path);
        if target.is_root() {
            return find_by_walk(self, path, maxdepth, withdirs).await;
        }
        if maxdepth == Some(0) {
            return Err(TosfsError::InvalidArgument("maxdepth must be at least 1".to_string()));
        }

        let objects =
            listing::list_recursive(self.store.as_ref(), &self.retry, &target, self.options.list_page_size).await?;
        let mut tree = listing::synthesize_tree(&target, &objects, maxdepth, withdirs);

        if objects.is_empty() && !target.key.is_empty() {
            if let Some(meta) = self.head(&target.bucket, &target.key).await? {
                return Ok(vec![listing::file_info(&target.bucket, &meta)]);
            }
        }
        if withdirs && (target.is_bucket() || !objects.is_empty()) {
            let me = if target.is_bucket() {
                ObjectInfo::bucket(target.bucket.clone())
            } else {
                ObjectInfo::directory(target.to_string())
            };
            tree.insert(me.name.clone(), me);
        }
        Ok(tree.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryStore;
    use crate::storage::{DiskUsage, OnError};

    const BUCKET: &str = "bucket";
    const WS: &str = "bucket/workspace";

    async fn setup_with(options: FsOptions) -> TosFileSystem<MemoryStore> {
        let store = Arc::new(MemoryStore::with_buckets(&[BUCKET]));
        store.put_object(BUCKET, "workspace/", Bytes::new()).await.unwrap();
        TosFileSystem::new(store, options, RetryPolicy::no_retry())
    }

    async fn setup() -> TosFileSystem<MemoryStore> {
        setup_with(FsOptions::default()).await
    }

    async fn write(fs: &TosFileSystem<MemoryStore>, path: &str, data: &'static [u8]) {
        fs.pipe_file(path, Bytes::from_static(data)).await.unwrap();
    }

    fn names(infos: &[ObjectInfo]) -> Vec<String> {
        infos.iter().map(|i| i.name.clone()).collect()
    }

    fn ws(rel: &str) -> String {
        format!("{}/{}", WS, rel)
    }

    #[tokio::test]
    async fn test_info() {
        let fs = setup().await;

        let root = fs.info("").await.unwrap();
        assert_eq!(root.name, "");
        assert_eq!(root.size, 0);
        assert_eq!(root.kind, ObjectKind::Directory);
        assert_eq!(fs.info("/").await.unwrap().name, "/");

        let bucket = fs.info(BUCKET).await.unwrap();
        assert_eq!(bucket.storage_class.as_deref(), Some("BUCKET"));
        assert_eq!(bucket.kind, ObjectKind::Bucket);

        let workspace = fs.info(WS).await.unwrap();
        assert_eq!(workspace.kind, ObjectKind::Directory);
        assert_eq!(workspace.name, WS);
        assert_eq!(fs.info("tos://bucket/workspace/").await.unwrap().name, WS);

        assert!(fs.info("bucket/nonexistent").await.unwrap_err().is_not_found());
        assert!(fs.info("nonexistent-bucket").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ls() {
        let fs = setup().await;

        let err = fs.ls("nonexistent", false).await.unwrap_err();
        assert!(matches!(err, TosfsError::Server { status: 404, .. }));

        assert!(fs.ls(WS, false).await.unwrap().is_empty());
        assert!(fs.ls(&ws("nonexistent"), false).await.unwrap().is_empty());

        let buckets = fs.ls("", false).await.unwrap();
        assert_eq!(names(&buckets), vec![BUCKET]);

        write(&fs, &ws("a.txt"), b"hello").await;
        fs.mkdir(&ws("sub"), false).await.unwrap();
        let listing = fs.ls(WS, false).await.unwrap();
        assert_eq!(names(&listing), vec![ws("a.txt"), ws("sub")]);
        assert_eq!(listing[0].size, 5);

        let file = fs.ls(&ws("a.txt"), false).await.unwrap();
        assert_eq!(names(&file), vec![ws("a.txt")]);
        assert!(file[0].is_file());
    }

    #[tokio::test]
    async fn test_ls_cache_and_invalidation() {
        let fs = setup().await;
        write(&fs, &ws("a"), b"1").await;

        fs.ls(WS, false).await.unwrap();
        let calls = fs.store().list_calls();
        fs.ls(WS, false).await.unwrap();
        assert_eq!(fs.store().list_calls(), calls);

        let heads = fs.store().head_calls();
        assert!(fs.info(&ws("a")).await.unwrap().is_file());
        assert_eq!(fs.store().head_calls(), heads);

        write(&fs, &ws("b"), b"2").await;
        assert_eq!(fs.ls(WS, false).await.unwrap().len(), 2);
        assert!(fs.store().list_calls() > calls);

        // out-of-band write is only seen after refresh
        fs.store().put_object(BUCKET, "workspace/c", Bytes::new()).await.unwrap();
        assert_eq!(fs.ls(WS, false).await.unwrap().len(), 2);
        assert_eq!(fs.ls(WS, true).await.unwrap().len(), 3);

        fs.store().put_object(BUCKET, "workspace/d", Bytes::new()).await.unwrap();
        fs.invalidate_cache(Some(WS));
        assert_eq!(fs.ls(WS, false).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rm_file_is_idempotent() {
        let fs = setup().await;
        let file = ws("file");
        write(&fs, &file, b"hello").await;

        fs.rm_file(&file).await.unwrap();
        fs.rm_file(&file).await.unwrap();
        assert!(!fs.exists(&file).await.unwrap());

        let err = fs.rm_file(WS).await.unwrap_err();
        assert!(matches!(err, TosfsError::IsADirectory(_)));
    }

    #[tokio::test]
    async fn test_rmdir() {
        let fs = setup().await;

        assert!(matches!(fs.rmdir(BUCKET).await.unwrap_err(), TosfsError::Tosfs { .. }));

        let dir = ws("dir");
        let file = ws("dir/file");
        fs.mkdir(&dir, false).await.unwrap();
        write(&fs, &file, b"data").await;

        assert!(matches!(fs.rmdir(&dir).await.unwrap_err(), TosfsError::DirectoryNotEmpty(_)));
        assert!(matches!(fs.rmdir(&file).await.unwrap_err(), TosfsError::NotADirectory(_)));

        fs.rm_file(&file).await.unwrap();
        fs.rmdir(&dir).await.unwrap();
        assert!(!names(&fs.ls(WS, true).await.unwrap()).contains(&dir));
        assert!(fs.rmdir(&dir).await.unwrap_err().is_not_found());

        fs.rmdir(WS).await.unwrap();
        assert!(!names(&fs.ls(BUCKET, true).await.unwrap()).contains(&WS.to_string()));
    }

    #[tokio::test]
    async fn test_mkdir() {
        let fs = setup().await;

        let nested = ws("a/b");
        assert!(fs.mkdir(&nested, false).await.unwrap_err().is_not_found());
        fs.mkdir(&nested, true).await.unwrap();
        assert!(fs.store().head_object(BUCKET, "workspace/a/").await.unwrap().is_some());
        assert!(fs.store().head_object(BUCKET, "workspace/a/b/").await.unwrap().is_some());
        assert!(fs.isdir(&nested).await.unwrap());

        assert!(matches!(fs.mkdir(&nested, true).await.unwrap_err(), TosfsError::AlreadyExists(_)));
        fs.makedirs(&nested, true).await.unwrap();
        assert!(fs.makedirs(&nested, false).await.is_err());

        write(&fs, &ws("f"), b"x").await;
        assert!(matches!(fs.mkdir(&ws("f/g"), true).await.unwrap_err(), TosfsError::NotADirectory(_)));

        fs.mkdir("newbucket", false).await.unwrap();
        assert_eq!(fs.info("newbucket").await.unwrap().kind, ObjectKind::Bucket);
        assert!(names(&fs.ls("", false).await.unwrap()).contains(&"newbucket".to_string()));
    }

    async fn build_tree(fs: &TosFileSystem<MemoryStore>) {
        write(fs, &ws("a.txt"), b"a").await;
        write(fs, &ws("dir1/b.txt"), b"bb").await;
        write(fs, &ws("dir1/sub/c.txt"), b"ccc").await;
        fs.mkdir(&ws("dir2"), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_walk() {
        let fs = setup().await;
        build_tree(&fs).await;

        let topdown = fs.walk(WS, None, true).await.unwrap();
        let roots: Vec<&str> = topdown.iter().map(|e| e.root.as_str()).collect();
        assert_eq!(roots, vec![WS.to_string(), ws("dir1"), ws("dir1/sub"), ws("dir2")]);
        assert_eq!(topdown[0].dir_names(), vec!["dir1", "dir2"]);
        assert_eq!(topdown[0].file_names(), vec!["a.txt"]);

        let bottom_up = fs.walk(WS, None, false).await.unwrap();
        let roots: Vec<&str> = bottom_up.iter().map(|e| e.root.as_str()).collect();
        assert_eq!(roots, vec![ws("dir1/sub"), ws("dir1"), ws("dir2"), WS.to_string()]);

        let shallow = fs.walk(WS, Some(1), true).await.unwrap();
        assert_eq!(shallow.len(), 1);

        assert!(matches!(fs.walk(WS, Some(0), true).await.unwrap_err(), TosfsError::InvalidArgument(_)));
        assert!(fs.walk(&ws("missing"), None, true).await.unwrap().iter().all(|e| e.dirs.is_empty()));
    }

    #[tokio::test]
    async fn test_find() {
        let fs = setup().await;
        build_tree(&fs).await;

        let files = fs.find(WS, None, false).await.unwrap();
        assert_eq!(names(&files), vec![ws("a.txt"), ws("dir1/b.txt"), ws("dir1/sub/c.txt")]);

        let all = fs.find(WS, None, true).await.unwrap();
        assert_eq!(
            names(&all),
            vec![
                WS.to_string(),
                ws("a.txt"),
                ws("dir1"),
                ws("dir1/b.txt"),
                ws("dir1/sub"),
                ws("dir1/sub/c.txt"),
                ws("dir2"),
            ]
        );
        let walked = find_by_walk(&fs, WS, None, true).await.unwrap();
        assert_eq!(names(&walked), names(&all));

        let shallow = fs.find(WS, Some(1), false).await.unwrap();
        assert_eq!(names(&shallow), vec![ws("a.txt")]);

        let single = fs.find(&ws("a.txt"), None, false).await.unwrap();
        assert_eq!(names(&single), vec![ws("a.txt")]);
        assert!(fs.find(&ws("missing"), None, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_du() {
        let fs = setup().await;
        write(&fs, &ws("test_dir/test_file.txt"), b"hello, world!").await;
        write(&fs, &ws("test_dir/nested_dir/nested_file.txt"), b"nested content").await;

        assert_eq!(fs.du(WS, true, None, false).await.unwrap(), DiskUsage::Total(27));

        let DiskUsage::Entries(files) = fs.du(WS, false, None, false).await.unwrap() else {
            panic!("expected entries");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files[&ws("test_dir/test_file.txt")], 13);
        assert_eq!(files[&ws("test_dir/nested_dir/nested_file.txt")], 14);

        let DiskUsage::Entries(with_dirs) = fs.du(WS, false, None, true).await.unwrap() else {
            panic!("expected entries");
        };
        assert_eq!(with_dirs[WS], 27);
        assert_eq!(with_dirs[&ws("test_dir")], 27);
        assert_eq!(with_dirs[&ws("test_dir/nested_dir")], 14);
        assert_eq!(with_dirs.len(), 5);
        assert_eq!(fs.du(WS, true, None, true).await.unwrap(), DiskUsage::Total(95));

        let DiskUsage::Entries(shallow) = fs.du(WS, false, Some(2), false).await.unwrap() else {
            panic!("expected entries");
        };
        assert_eq!(shallow.keys().cloned().collect::<Vec<_>>(), vec![ws("test_dir/test_file.txt")]);
    }

    #[tokio::test]
    async fn test_cat_file() {
        let fs = setup().await;
        let file = ws("digits");
        write(&fs, &file, b"0123456789").await;

        assert_eq!(&fs.cat_file(&file, None, None).await.unwrap()[..], b"0123456789");
        assert_eq!(&fs.cat_file(&file, Some(2), Some(5)).await.unwrap()[..], b"234");
        assert_eq!(&fs.cat_file(&file, Some(-3), None).await.unwrap()[..], b"789");
        assert_eq!(&fs.cat_file(&file, Some(-5), Some(-2)).await.unwrap()[..], b"567");
        assert!(fs.cat_file(&file, Some(8), Some(3)).await.unwrap().is_empty());

        assert!(matches!(fs.cat_file(WS, None, None).await.unwrap_err(), TosfsError::IsADirectory(_)));
        assert!(fs.cat_file(&ws("missing"), None, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cat_on_error() {
        let fs = setup().await;
        write(&fs, &ws("a"), b"A").await;
        write(&fs, &ws("sub/b"), b"B").await;
        let paths = vec![ws("a"), ws("sub/b"), ws("missing")];

        let omitted = fs.cat(&paths, false, OnError::Omit).await.unwrap();
        assert_eq!(omitted.len(), 2);
        assert_eq!(&omitted[&ws("a")].as_ref().unwrap()[..], b"A");

        let returned = fs.cat(&paths, false, OnError::Return).await.unwrap();
        assert_eq!(returned.len(), 3);
        assert!(returned[&ws("missing")].as_ref().unwrap_err().is_not_found());

        assert!(fs.cat(&paths, false, OnError::Raise).await.is_err());

        let recursive = fs.cat(&[WS.to_string()], true, OnError::Raise).await.unwrap();
        assert_eq!(recursive.keys().cloned().collect::<Vec<_>>(), vec![ws("a"), ws("sub/b")]);
    }

    #[tokio::test]
    async fn test_copy() {
        let fs = setup().await;
        write(&fs, &ws("src/a"), b"A").await;
        write(&fs, &ws("src/sub/b"), b"B").await;

        fs.copy(&ws("src"), &ws("dst"), true, OnError::Raise).await.unwrap();
        assert_eq!(&fs.cat_file(&ws("dst/a"), None, None).await.unwrap()[..], b"A");
        assert_eq!(&fs.cat_file(&ws("dst/sub/b"), None, None).await.unwrap()[..], b"B");

        // into an existing directory the source keeps its name
        fs.copy(&ws("src"), &ws("dst"), true, OnError::Raise).await.unwrap();
        assert!(fs.isfile(&ws("dst/src/sub/b")).await.unwrap());

        // trailing slash copies the contents
        fs.copy(&format!("{}/", ws("src")), &ws("flat"), true, OnError::Raise).await.unwrap();
        assert!(fs.isfile(&ws("flat/a")).await.unwrap());

        let err = fs.copy(&ws("src"), &ws("other"), false, OnError::Raise).await.unwrap_err();
        assert!(matches!(err, TosfsError::IsADirectory(_)));
        fs.copy(&ws("src"), &ws("other"), false, OnError::Omit).await.unwrap();

        assert!(fs.copy(&ws("missing"), &ws("x"), false, OnError::Raise).await.unwrap_err().is_not_found());
        fs.copy(&ws("missing"), &ws("x"), false, OnError::Omit).await.unwrap();

        fs.copy(&ws("src/a"), &ws("dst"), false, OnError::Raise).await.unwrap();
        assert!(fs.isfile(&ws("dst/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cp_file() {
        let fs = setup().await;
        write(&fs, &ws("a"), b"A").await;
        fs.cp_file(&ws("a"), &ws("b")).await.unwrap();
        assert_eq!(&fs.cat_file(&ws("b"), None, None).await.unwrap()[..], b"A");

        assert!(fs.cp_file(&ws("missing"), &ws("c")).await.unwrap_err().is_not_found());
        assert!(matches!(fs.cp_file(WS, &ws("c")).await.unwrap_err(), TosfsError::IsADirectory(_)));
    }

    #[tokio::test]
    async fn test_mv() {
        let fs = setup().await;
        write(&fs, &ws("f"), b"file").await;
        fs.mv(&ws("f"), &ws("g")).await.unwrap();
        assert!(!fs.exists(&ws("f")).await.unwrap());
        assert_eq!(&fs.cat_file(&ws("g"), None, None).await.unwrap()[..], b"file");

        write(&fs, &ws("d/x"), b"x").await;
        write(&fs, &ws("d/y/z"), b"z").await;
        fs.mv(&ws("d"), &ws("e")).await.unwrap();
        assert!(!fs.exists(&ws("d")).await.unwrap());
        assert!(fs.isfile(&ws("e/x")).await.unwrap());
        assert!(fs.isfile(&ws("e/y/z")).await.unwrap());

        assert!(matches!(fs.mv(&ws("e"), &ws("e/inner")).await.unwrap_err(), TosfsError::InvalidArgument(_)));
        assert!(matches!(fs.mv(&ws("e"), &ws("g")).await.unwrap_err(), TosfsError::NotADirectory(_)));
        assert!(matches!(fs.mv(&ws("g"), &ws("e")).await.unwrap_err(), TosfsError::IsADirectory(_)));

        write(&fs, &ws("full/item"), b"i").await;
        assert!(matches!(fs.mv(&ws("e"), &ws("full")).await.unwrap_err(), TosfsError::DirectoryNotEmpty(_)));

        fs.mkdir(&ws("empty"), false).await.unwrap();
        fs.mv(&ws("e"), &ws("empty")).await.unwrap();
        assert!(fs.isfile(&ws("empty/y/z")).await.unwrap());

        assert!(fs.mv(&ws("missing"), &ws("other")).await.unwrap_err().is_not_found());
        assert!(fs.mv(&ws("missing"), &ws("missing")).await.unwrap_err().is_not_found());
        fs.mv(&ws("g"), &ws("g")).await.unwrap();
        assert!(fs.isfile(&ws("g")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rm_recursive() {
        let fs = setup().await;
        write(&fs, &ws("tree/a"), b"a").await;
        write(&fs, &ws("tree/sub/b"), b"b").await;
        fs.mkdir(&ws("tree/empty"), true).await.unwrap();
        write(&fs, &ws("x.tmp"), b"t").await;
        write(&fs, &ws("y.tmp"), b"t").await;

        let err = fs.rm(&[ws("tree")], false).await.unwrap_err();
        assert!(matches!(err, TosfsError::DirectoryNotEmpty(_)));

        fs.rm(&[ws("tree")], true).await.unwrap();
        assert!(!fs.exists(&ws("tree")).await.unwrap());
        assert!(fs.find(&ws("tree"), None, true).await.unwrap().is_empty());

        fs.rm(&[ws("*.tmp")], false).await.unwrap();
        assert!(fs.ls(WS, true).await.unwrap().is_empty());

        fs.rm(&[BUCKET.to_string()], true).await.unwrap();
        assert!(fs.exists(BUCKET).await.unwrap());
        assert!(fs.rm(&[ws("gone")], false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_readline_across_blocks() {
        let fs = setup().await;
        let file = ws("lines");
        write(&fs, &file, b"line1\nline2 is longer\nlast").await;

        let mut handle = fs.open(&file, "rb", Some(4)).await.unwrap();
        assert_eq!(handle.size(), 26);
        assert_eq!(&handle.readline().await.unwrap()[..], b"line1\n");
        assert_eq!(&handle.readline().await.unwrap()[..], b"line2 is longer\n");
        assert_eq!(&handle.readline().await.unwrap()[..], b"last");
        assert!(handle.readline().await.unwrap().is_empty());

        handle.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(handle.readlines().await.unwrap().len(), 3);

        handle.seek(std::io::SeekFrom::End(-4)).unwrap();
        assert_eq!(&handle.read(Some(2)).await.unwrap()[..], b"la");
        assert_eq!(handle.tell(), 24);
        assert_eq!(&handle.read_all().await.unwrap()[..], b"st");
        assert!(handle.read(Some(10)).await.unwrap().is_empty());
        assert!(handle.seek(std::io::SeekFrom::Current(-100)).is_err());

        assert!(handle.write(b"nope").await.is_err());
        handle.close().await.unwrap();
        assert!(handle.read(None).await.is_err());

        assert!(matches!(fs.open(WS, "rb", None).await.err(), Some(TosfsError::IsADirectory(_))));
        assert!(matches!(fs.open(&file, "ab", None).await.err(), Some(TosfsError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_multipart_write_with_small_parts() {
        let options = FsOptions {
            default_block_size: 4,
            min_part_size: 4,
            ..FsOptions::default()
        };
        let fs = setup_with(options).await;
        let file = ws("multipart");

        let mut handle = fs.open(&file, "wb", None).await.unwrap();
        handle.write(b"abc").await.unwrap();
        handle.write(b"defgh").await.unwrap();
        handle.write(b"ij").await.unwrap();
        assert_eq!(handle.tell(), 10);
        assert!(fs.store().head_object(BUCKET, "workspace/multipart").await.unwrap().is_none());
        assert_eq!(fs.store().pending_uploads(), 1);

        handle.close().await.unwrap();
        assert_eq!(fs.store().pending_uploads(), 0);
        assert_eq!(&fs.cat_file(&file, None, None).await.unwrap()[..], b"abcdefghij");
        assert!(handle.write(b"more").await.is_err());

        // the streaming writer shares the same part size
        let payload: Vec<u8> = (0..23u8).collect();
        fs.pipe_file(&ws("streamed"), Bytes::from(payload.clone())).await.unwrap();
        assert_eq!(&fs.cat_file(&ws("streamed"), None, None).await.unwrap()[..], &payload[..]);

        let mut small = fs.open(&ws("small"), "wb", None).await.unwrap();
        small.write(b"xy").await.unwrap();
        small.close().await.unwrap();
        assert_eq!(fs.size(&ws("small")).await.unwrap(), 2);

        let mut dropped = fs.open(&ws("discarded"), "wb", None).await.unwrap();
        dropped.write(b"123456").await.unwrap();
        dropped.discard().await;
        assert_eq!(fs.store().pending_uploads(), 0);
        assert!(!fs.exists(&ws("discarded")).await.unwrap());

        assert!(matches!(fs.open(WS, "wb", None).await.err(), Some(TosfsError::IsADirectory(_))));
        assert!(fs.open("missing-bucket/key", "wb", None).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_touch() {
        let fs = setup().await;
        let file = ws("touched");
        fs.touch(&file, false).await.unwrap();
        assert_eq!(fs.size(&file).await.unwrap(), 0);

        write(&fs, &file, b"content").await;
        assert!(matches!(fs.touch(&file, false).await.unwrap_err(), TosfsError::Unsupported(_)));
        fs.touch(&file, true).await.unwrap();
        assert_eq!(fs.size(&file).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_glob() {
        let fs = setup().await;
        write(&fs, &ws("a.txt"), b"a").await;
        write(&fs, &ws("b.log"), b"b").await;
        write(&fs, &ws("dir1/c.txt"), b"c").await;

        let txt = fs.glob(&ws("*.txt")).await.unwrap();
        assert_eq!(names(&txt), vec![ws("a.txt")]);

        let deep = fs.glob(&ws("**/*.txt")).await.unwrap();
        assert_eq!(names(&deep), vec![ws("a.txt"), ws("dir1/c.txt")]);

        let single = fs.glob(&ws("?.log")).await.unwrap();
        assert_eq!(names(&single), vec![ws("b.log")]);

        assert_eq!(names(&fs.glob(&ws("a.txt")).await.unwrap()), vec![ws("a.txt")]);
        assert!(fs.glob(&ws("*.csv")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_on_transient_errors() {
        let store = Arc::new(MemoryStore::with_buckets(&[BUCKET]));
        let retry = RetryPolicy {
            max_retry_num: 3,
            sleep_base: Duration::from_millis(1),
            sleep_max: Duration::from_millis(5),
        };
        let fs = TosFileSystem::new(store.clone(), FsOptions::default(), retry);

        store.inject_failure(TosfsError::server(503, "ServiceUnavailable", "busy"));
        store.inject_failure(TosfsError::server(500, "InternalError", "oops"));
        assert!(fs.ls(BUCKET, true).await.unwrap().is_empty());

        store.inject_failure(TosfsError::server(403, "AccessDenied", "denied"));
        assert!(fs.ls(BUCKET, true).await.is_err());

        for _ in 0..3 {
            store.inject_failure(TosfsError::server(429, "TooManyRequests", "slow down"));
        }
        assert!(fs.ls(BUCKET, true).await.is_err());
    }

    #[tokio::test]
    async fn test_put_and_get_file() {
        let fs = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("upload.txt");
        tokio::fs::write(&local, b"local data").await.unwrap();

        fs.put_file(&local, &ws("uploaded.txt"), None).await.unwrap();
        assert_eq!(&fs.cat_file(&ws("uploaded.txt"), None, None).await.unwrap()[..], b"local data");

        let downloaded = dir.path().join("nested/download.txt");
        fs.get_file(&ws("uploaded.txt"), &downloaded).await.unwrap();
        assert_eq!(tokio::fs::read(&downloaded).await.unwrap(), b"local data");

        let mut reader = fs.open_reader(&ws("uploaded.txt"), Some(6..10)).await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"data");
    }
}
