use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TosfsError};
use crate::utils;

/// 进度回调类型 / Progress callback type
/// 参数: (已完成字节数, 总字节数) / Parameters: (completed_bytes, total_bytes)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Configuration item definition / 配置项定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl ConfigItem {
    pub fn new(name: &str, item_type: &str) -> Self {
        Self {
            name: name.to_string(),
            item_type: item_type.to_string(),
            default: None,
            required: false,
            help: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, val: &str) -> Self {
        self.default = Some(val.to_string());
        self
    }

    pub fn help(mut self, val: &str) -> Self {
        self.help = Some(val.to_string());
        self
    }
}

/// Kind of a filesystem entry / 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Directory,
    Bucket,
}

/// File entry information / 文件条目信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Stripped path, `bucket/key` / 去掉协议的完整路径
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl ObjectInfo {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: ObjectKind::File,
            last_modified: None,
            etag: None,
            storage_class: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: ObjectKind::Directory,
            last_modified: None,
            etag: None,
            storage_class: Some("DIRECTORY".to_string()),
        }
    }

    pub fn bucket(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: ObjectKind::Bucket,
            last_modified: None,
            etag: None,
            storage_class: Some("BUCKET".to_string()),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ObjectKind::Directory | ObjectKind::Bucket)
    }

    pub fn is_file(&self) -> bool {
        self.kind == ObjectKind::File
    }

    /// Last path segment / 最后一段名称
    pub fn basename(&self) -> &str {
        let trimmed = self.name.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

/// One level of a directory walk / 目录遍历的一层
#[derive(Debug, Clone, PartialEq)]
pub struct WalkEntry {
    pub root: String,
    pub dirs: Vec<ObjectInfo>,
    pub files: Vec<ObjectInfo>,
}

impl WalkEntry {
    pub fn dir_names(&self) -> Vec<&str> {
        self.dirs.iter().map(|d| d.basename()).collect()
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.basename()).collect()
    }
}

/// What to do when one path of a batch fails / 批量操作出错时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    #[default]
    Raise,
    Omit,
    Return,
}

impl std::str::FromStr for OnError {
    type Err = TosfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raise" => Ok(OnError::Raise),
            "omit" | "ignore" => Ok(OnError::Omit),
            "return" => Ok(OnError::Return),
            other => Err(TosfsError::InvalidArgument(format!("on_error: {}", other))),
        }
    }
}

/// Result of `du` / 空间占用结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskUsage {
    Total(u64),
    Entries(BTreeMap<String, u64>),
}

/// Driver capability declaration / 驱动能力声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capability {
    /// Support range reading / 支持范围读取
    pub can_range_read: bool,
    /// Support append write / 支持追加写入
    pub can_append: bool,
    /// Support multipart upload / 支持分片上传
    pub can_multipart_upload: bool,
    /// Support server-side copy (no download needed) / 支持服务端复制
    pub can_server_side_copy: bool,
    /// Support batch delete / 支持批量删除
    pub can_batch_delete: bool,
    /// Support bucket creation / 支持创建桶
    pub can_create_bucket: bool,
    /// Minimum size of a non-final multipart part / 分片最小大小
    pub min_part_size: Option<u64>,
}

/// Resolve python-style offsets against a size / 解析可为负数的偏移
pub fn resolve_range(size: u64, start: Option<i64>, end: Option<i64>) -> Range<u64> {
    let resolve = |offset: i64| -> u64 {
        if offset < 0 {
            size.saturating_sub(offset.unsigned_abs())
        } else {
            (offset as u64).min(size)
        }
    };
    let start = start.map(resolve).unwrap_or(0);
    let end = end.map(resolve).unwrap_or(size);
    start..end.max(start)
}

/// Filesystem interface (primitive operations plus derived ones) / 文件系统接口
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Protocol name, e.g. `tos` / 协议名称
    fn protocol(&self) -> &str;

    /// Backend capabilities / 后端能力
    fn capabilities(&self) -> Capability;

    /// Strip protocol and normalize separators / 去掉协议并规范化
    fn normalize_path(&self, path: &str) -> String {
        let prefix = format!("{}://", self.protocol());
        let path = path.trim();
        utils::fix_and_clean_path(path.strip_prefix(&prefix).unwrap_or(path))
    }

    /// List directory contents / 列出目录内容
    async fn ls(&self, path: &str, refresh: bool) -> Result<Vec<ObjectInfo>>;

    /// Stat a path / 获取路径信息
    async fn info(&self, path: &str) -> Result<ObjectInfo>;

    /// Open file reader (supports range reading) / 打开文件读取器
    async fn open_reader(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<Box<dyn AsyncRead + Unpin + Send>>;

    /// Open file writer / 打开文件写入器
    /// The object becomes visible once the writer is shut down.
    async fn open_writer(
        &self,
        path: &str,
        size_hint: Option<u64>,
        progress: Option<ProgressCallback>,
    ) -> Result<Box<dyn AsyncWrite + Unpin + Send>>;

    /// Create directory / 创建目录
    async fn mkdir(&self, path: &str, create_parents: bool) -> Result<()>;

    /// Remove an empty directory / 删除空目录
    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Delete one file / 删除文件
    async fn rm_file(&self, path: &str) -> Result<()>;

    /// Move file or directory / 移动文件或目录
    async fn mv(&self, src: &str, dst: &str) -> Result<()>;

    /// Drop cached listings, everything when `path` is None / 清除缓存
    fn invalidate_cache(&self, path: Option<&str>);

    /// Write complete file data / 写入完整文件
    async fn pipe_file(&self, path: &str, data: Bytes) -> Result<()> {
        let mut writer = self.open_writer(path, Some(data.len() as u64), None).await?;
        writer.write_all(&data).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Copy one file (default implementation: read then write) / 复制文件
    async fn cp_file(&self, src: &str, dst: &str) -> Result<()> {
        let mut reader = self.open_reader(src, None).await?;
        let mut writer = self.open_writer(dst, None, None).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        // 必须调用shutdown确保所有数据写入完成（特别是分片上传）
        writer.shutdown().await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.info(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn isdir(&self, path: &str) -> Result<bool> {
        match self.info(path).await {
            Ok(info) => Ok(info.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn isfile(&self, path: &str) -> Result<bool> {
        match self.info(path).await {
            Ok(info) => Ok(info.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.info(path).await?.size)
    }

    /// Read a byte range; negative offsets count from the end / 读取文件内容
    async fn cat_file(&self, path: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        let info = self.info(path).await?;
        if info.is_dir() {
            return Err(TosfsError::IsADirectory(info.name));
        }
        let range = resolve_range(info.size, start, end);
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let mut reader = self.open_reader(path, Some(range)).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Read several files / 批量读取文件
    async fn cat(
        &self,
        paths: &[String],
        recursive: bool,
        on_error: OnError,
    ) -> Result<BTreeMap<String, Result<Bytes>>> {
        let expanded = self.expand_path(paths, recursive, None).await?;
        let mut out = BTreeMap::new();
        for path in expanded {
            match self.cat_file(&path, None, None).await {
                Ok(data) => {
                    out.insert(path, Ok(data));
                }
                Err(TosfsError::IsADirectory(_)) => continue,
                Err(e) => match on_error {
                    OnError::Raise => return Err(e),
                    OnError::Omit => tracing::debug!("cat skipped {}: {}", path, e),
                    OnError::Return => {
                        out.insert(path, Err(e));
                    }
                },
            }
        }
        Ok(out)
    }

    /// Walk a tree like `os.walk` / 遍历目录树
    async fn walk(&self, path: &str, maxdepth: Option<usize>, topdown: bool) -> Result<Vec<WalkEntry>> {
        if maxdepth == Some(0) {
            return Err(TosfsError::InvalidArgument("maxdepth must be at least 1".to_string()));
        }
        let mut out = Vec::new();
        walk_dir(self, self.normalize_path(path), maxdepth, topdown, &mut out).await?;
        Ok(out)
    }

    /// List all files below path, sorted / 列出路径下全部文件
    async fn find(&self, path: &str, maxdepth: Option<usize>, withdirs: bool) -> Result<Vec<ObjectInfo>> {
        find_by_walk(self, path, maxdepth, withdirs).await
    }

    /// Space used below path / 统计空间占用
    /// Directory sizes are the totals of their contents.
    async fn du(&self, path: &str, total: bool, maxdepth: Option<usize>, withdirs: bool) -> Result<DiskUsage> {
        let base = self.normalize_path(path);
        let all = self.find(&base, None, withdirs).await?;

        let mut sizes = BTreeMap::new();
        for entry in &all {
            if let Some(limit) = maxdepth {
                if utils::path_depth(&base, &entry.name).map_or(false, |d| d > limit) {
                    continue;
                }
            }
            let size = if entry.is_dir() {
                all.iter()
                    .filter(|f| f.is_file() && utils::relative_path(&entry.name, &f.name).is_some())
                    .map(|f| f.size)
                    .sum()
            } else {
                entry.size
            };
            sizes.insert(entry.name.clone(), size);
        }

        if total {
            Ok(DiskUsage::Total(sizes.values().sum()))
        } else {
            Ok(DiskUsage::Entries(sizes))
        }
    }

    /// Match a glob pattern (`*`, `?`, `**`, `[..]`) / 通配符匹配
    async fn glob(&self, pattern: &str) -> Result<Vec<ObjectInfo>> {
        let pattern = self.normalize_path(pattern);
        if !utils::has_magic(&pattern) {
            return match self.info(&pattern).await {
                Ok(info) => Ok(vec![info]),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let magic_at = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
        let root = match pattern[..magic_at].rfind('/') {
            Some(idx) => &pattern[..idx],
            None => "",
        };
        let depth = if pattern.contains("**") {
            None
        } else {
            Some(pattern[root.len()..].trim_start_matches('/').split('/').count())
        };
        let regex = utils::glob_to_regex(&pattern)
            .map_err(|e| TosfsError::InvalidArgument(format!("glob pattern {}: {}", pattern, e)))?;

        let candidates = self.find(root, depth, true).await?;
        Ok(candidates
            .into_iter()
            .filter(|info| info.name != root && regex.is_match(&info.name))
            .collect())
    }

    /// Expand globs and, when recursive, directory contents / 展开路径
    async fn expand_path(&self, paths: &[String], recursive: bool, maxdepth: Option<usize>) -> Result<Vec<String>> {
        let mut out = BTreeSet::new();
        for path in paths {
            let path = self.normalize_path(path);
            if utils::has_magic(&path) {
                for info in self.glob(&path).await? {
                    if recursive && info.is_dir() {
                        for child in self.find(&info.name, maxdepth, true).await? {
                            out.insert(child.name);
                        }
                    }
                    out.insert(info.name);
                }
            } else if recursive {
                for child in self.find(&path, maxdepth, true).await? {
                    out.insert(child.name);
                }
                out.insert(path);
            } else {
                out.insert(path);
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Delete files, and directory trees when recursive / 删除文件或目录树
    async fn rm(&self, paths: &[String], recursive: bool) -> Result<()> {
        let expanded = self.expand_path(paths, recursive, None).await?;
        // deepest entries first
        for path in expanded.iter().rev() {
            match self.info(path).await {
                Ok(info) if info.kind == ObjectKind::Bucket => {
                    tracing::debug!("rm keeps bucket {}", path);
                }
                Ok(info) if info.is_dir() => match self.rmdir(path).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                },
                Ok(_) => self.rm_file(path).await?,
                Err(e) if e.is_not_found() && recursive => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Copy files or trees / 复制文件或目录树
    /// A source ending in `/` copies its contents into `dst`.
    async fn copy(&self, src: &str, dst: &str, recursive: bool, on_error: OnError) -> Result<()> {
        let src_path = self.normalize_path(src);
        let dst_path = self.normalize_path(dst);

        let src_info = match self.info(&src_path).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() && on_error != OnError::Raise => {
                tracing::debug!("copy skipped missing source {}", src_path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !src_info.is_dir() {
            let target = if self.isdir(&dst_path).await? {
                utils::join_path(&dst_path, src_info.basename())
            } else {
                dst_path
            };
            return skip_or_raise(self.cp_file(&src_path, &target).await, on_error);
        }

        if !recursive {
            return skip_or_raise(Err(TosfsError::IsADirectory(src_path)), on_error);
        }

        let target_root = if src.ends_with('/') || !self.exists(&dst_path).await? {
            dst_path
        } else {
            utils::join_path(&dst_path, src_info.basename())
        };
        self.makedirs(&target_root, true).await?;

        for entry in self.find(&src_path, None, true).await? {
            let rel = match utils::relative_path(&src_path, &entry.name) {
                Some(rel) if !rel.is_empty() => rel,
                _ => continue,
            };
            let target = utils::join_path(&target_root, &rel);
            if entry.is_dir() {
                self.makedirs(&target, true).await?;
            } else {
                skip_or_raise(self.cp_file(&entry.name, &target).await, on_error)?;
            }
        }
        Ok(())
    }

    async fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        if self.exists(path).await? {
            if exist_ok {
                return Ok(());
            }
            return Err(TosfsError::AlreadyExists(self.normalize_path(path)));
        }
        self.mkdir(path, true).await
    }

    /// Create an empty file / 创建空文件
    async fn touch(&self, path: &str, truncate: bool) -> Result<()> {
        if truncate || !self.exists(path).await? {
            return self.pipe_file(path, Bytes::new()).await;
        }
        Err(TosfsError::Unsupported(format!(
            "touch without truncate on existing file {}",
            self.normalize_path(path)
        )))
    }

    /// Upload a local file or directory / 上传本地文件
    async fn put_file(&self, lpath: &Path, rpath: &str, progress: Option<ProgressCallback>) -> Result<()> {
        let meta = tokio::fs::metadata(lpath).await?;
        if meta.is_dir() {
            return self.makedirs(rpath, true).await;
        }
        let mut file = tokio::fs::File::open(lpath).await?;
        let mut writer = self.open_writer(rpath, Some(meta.len()), progress).await?;
        tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Download a file or create a local directory / 下载到本地
    async fn get_file(&self, rpath: &str, lpath: &Path) -> Result<()> {
        if self.isdir(rpath).await? {
            tokio::fs::create_dir_all(lpath).await?;
            return Ok(());
        }
        let mut reader = self.open_reader(rpath, None).await?;
        if let Some(parent) = lpath.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::File::create(lpath).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
}

fn skip_or_raise(result: Result<()>, on_error: OnError) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if on_error == OnError::Raise => Err(e),
        Err(e) => {
            tracing::debug!("copy skipped: {}", e);
            Ok(())
        }
    }
}

fn walk_dir<'a, F: FileSystem + ?Sized>(
    fs: &'a F,
    path: String,
    maxdepth: Option<usize>,
    topdown: bool,
    out: &'a mut Vec<WalkEntry>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let listing = match fs.ls(&path, false).await {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for info in listing {
            let pathname = info.name.trim_end_matches('/');
            if info.is_dir() && pathname != path {
                dirs.push(info);
            } else {
                files.push(info);
            }
        }

        let entry = WalkEntry {
            root: path.clone(),
            dirs: dirs.clone(),
            files,
        };
        if topdown {
            out.push(entry.clone());
        }

        let next_depth = match maxdepth {
            Some(depth) if depth <= 1 => {
                if !topdown {
                    out.push(entry);
                }
                return Ok(());
            }
            Some(depth) => Some(depth - 1),
            None => None,
        };

        for dir in dirs {
            walk_dir(fs, dir.name, next_depth, topdown, &mut *out).await?;
        }

        if !topdown {
            out.push(entry);
        }
        Ok(())
    }
    .boxed()
}

/// Walk-based `find`, usable by backends that override `find` / 基于遍历的查找
pub async fn find_by_walk<F: FileSystem + ?Sized>(
    fs: &F,
    path: &str,
    maxdepth: Option<usize>,
    withdirs: bool,
) -> Result<Vec<ObjectInfo>> {
    let path = fs.normalize_path(path);
    let mut out: BTreeMap<String, ObjectInfo> = BTreeMap::new();

    if withdirs && !path.is_empty() && fs.isdir(&path).await? {
        out.insert(path.clone(), fs.info(&path).await?);
    }

    for entry in fs.walk(&path, maxdepth, true).await? {
        if withdirs {
            for dir in entry.dirs {
                out.insert(dir.name.clone(), dir);
            }
        }
        for file in entry.files {
            out.insert(file.name.clone(), file);
        }
    }

    if out.is_empty() && fs.isfile(&path).await? {
        out.insert(path.clone(), fs.info(&path).await?);
    }
    Ok(out.into_values().collect())
}

pub mod manager;
pub mod object;

pub use manager::{FactoryInfo, FsBox, FsFactory, FsRegistry};
pub use object::{BucketMeta, CompletedPart, ListPage, ObjectMeta, ObjectStore};
