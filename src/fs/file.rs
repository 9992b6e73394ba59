//! Buffered file handle / 带缓冲的文件句柄
//!
//! Reads fetch whole blocks with ranged GETs. Writes buffer up to one part
//! and switch to a multipart upload once the first part is full.

use std::io::SeekFrom;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::cache::DirCache;
use super::path::TosPath;
use super::TosFileSystem;
use crate::error::{Result, TosfsError};
use crate::retry::RetryPolicy;
use crate::storage::{CompletedPart, ObjectStore};

/// File open mode / 打开模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl FromStr for OpenMode {
    type Err = TosfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "rb" => Ok(OpenMode::Read),
            "w" | "wb" => Ok(OpenMode::Write),
            "a" | "ab" => Err(TosfsError::Unsupported("append mode".to_string())),
            other => Err(TosfsError::InvalidArgument(format!("file mode: {}", other))),
        }
    }
}

/// Open file on the object store / 对象存储上的文件
pub struct TosFile<S: ObjectStore> {
    store: Arc<S>,
    retry: RetryPolicy,
    cache: Arc<DirCache>,
    path: TosPath,
    mode: OpenMode,
    block_size: u64,
    closed: bool,

    // read side
    size: u64,
    pos: u64,
    block: Bytes,
    block_start: u64,

    // write side
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
}

impl<S: ObjectStore> TosFile<S> {
    /// Open for reading, the object is stat'ed first / 以读模式打开
    pub async fn open_read(fs: &TosFileSystem<S>, path: &str, block_size: Option<u64>) -> Result<Self> {
        let info = crate::storage::FileSystem::info(fs, path).await?;
        if info.is_dir() {
            return Err(TosfsError::IsADirectory(info.name));
        }
        let mut file = Self::new(fs, TosPath::parse(&info.name), OpenMode::Read, block_size);
        file.size = info.size;
        Ok(file)
    }

    /// Open for writing, nothing is visible before `close` / 以写模式打开
    pub async fn open_write(fs: &TosFileSystem<S>, path: &str, block_size: Option<u64>) -> Result<Self> {
        let target = fs.parse(path);
        if target.key.is_empty() {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }
        let exists = fs
            .retry()
            .run("bucket_exists", || fs.store().bucket_exists(&target.bucket))
            .await?;
        if !exists {
            return Err(TosfsError::NotFound(target.bucket.clone()));
        }
        if fs.dir_exists(&target).await? {
            return Err(TosfsError::IsADirectory(target.to_string()));
        }
        Ok(Self::new(fs, target, OpenMode::Write, block_size))
    }

    fn new(fs: &TosFileSystem<S>, path: TosPath, mode: OpenMode, block_size: Option<u64>) -> Self {
        let block_size = match mode {
            OpenMode::Read => block_size.unwrap_or(fs.options().default_block_size).max(1),
            OpenMode::Write => fs.part_size(block_size),
        };
        Self {
            store: fs.store().clone(),
            retry: fs.retry().clone(),
            cache: fs.cache().clone(),
            path,
            mode,
            block_size,
            closed: false,
            size: 0,
            pos: 0,
            block: Bytes::new(),
            block_start: 0,
            buffer: BytesMut::new(),
            upload_id: None,
            parts: Vec::new(),
        }
    }

    pub fn path(&self) -> &TosPath {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Object size; bytes written so far in write mode / 文件大小
    pub fn size(&self) -> u64 {
        match self.mode {
            OpenMode::Read => self.size,
            OpenMode::Write => self.pos,
        }
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(TosfsError::InvalidArgument(format!("I/O operation on closed file {}", self.path)));
        }
        Ok(())
    }

    fn check_mode(&self, mode: OpenMode) -> Result<()> {
        self.check_open()?;
        if self.mode != mode {
            let action = match mode {
                OpenMode::Read => "readable",
                OpenMode::Write => "writable",
            };
            return Err(TosfsError::Unsupported(format!("{} is not {}", self.path, action)));
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.size() as i128 + delta as i128,
        };
        if target < 0 {
            return Err(TosfsError::InvalidArgument("negative seek position".to_string()));
        }
        let target = target as u64;
        if self.mode == OpenMode::Write && target != self.pos {
            return Err(TosfsError::Unsupported("seek in write mode".to_string()));
        }
        self.pos = target;
        Ok(self.pos)
    }

    /// Make sure the block holding `pos` is loaded / 加载当前位置所在的块
    async fn fill_block(&mut self, min_len: u64) -> Result<()> {
        let block_end = self.block_start + self.block.len() as u64;
        if self.pos >= self.block_start && self.pos < block_end {
            return Ok(());
        }
        let start = self.pos;
        let end = (start + self.block_size.max(min_len)).min(self.size);
        if start >= end {
            self.block = Bytes::new();
            self.block_start = start;
            return Ok(());
        }
        let store = &self.store;
        let path = &self.path;
        self.block = self
            .retry
            .run("get_object", || store.get_object(&path.bucket, &path.key, Some(start..end)))
            .await?;
        self.block_start = start;
        tracing::trace!("fetched {}..{} of {}", start, end, self.path);
        Ok(())
    }

    /// Read up to `n` bytes, the rest of the file when None / 读取至多n个字节
    pub async fn read(&mut self, n: Option<usize>) -> Result<Bytes> {
        self.check_mode(OpenMode::Read)?;
        let remaining = self.size.saturating_sub(self.pos);
        let wanted = n.map_or(remaining, |n| (n as u64).min(remaining));
        if wanted == 0 {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity(wanted as usize);
        while (out.len() as u64) < wanted {
            self.fill_block(wanted - out.len() as u64).await?;
            let offset = (self.pos - self.block_start) as usize;
            let available = &self.block[offset..];
            if available.is_empty() {
                break;
            }
            let take = available.len().min(wanted as usize - out.len());
            out.extend_from_slice(&available[..take]);
            self.pos += take as u64;
        }
        Ok(out.freeze())
    }

    pub async fn read_all(&mut self) -> Result<Bytes> {
        self.read(None).await
    }

    /// Read one line including its `\n` / 读取一行
    pub async fn readline(&mut self) -> Result<Bytes> {
        self.check_mode(OpenMode::Read)?;
        let mut out = BytesMut::new();
        while self.pos < self.size {
            self.fill_block(1).await?;
            let offset = (self.pos - self.block_start) as usize;
            let available = &self.block[offset..];
            if available.is_empty() {
                break;
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    out.extend_from_slice(&available[..=idx]);
                    self.pos += idx as u64 + 1;
                    break;
                }
                None => {
                    out.extend_from_slice(available);
                    self.pos += available.len() as u64;
                }
            }
        }
        Ok(out.freeze())
    }

    pub async fn readlines(&mut self) -> Result<Vec<Bytes>> {
        let mut lines = Vec::new();
        loop {
            let line = self.readline().await?;
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Buffer data, uploading full parts / 写入数据，满块即上传
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_mode(OpenMode::Write)?;
        self.buffer.extend_from_slice(data);
        self.pos += data.len() as u64;
        self.upload_full_parts().await?;
        Ok(data.len())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.mode == OpenMode::Write {
            self.upload_full_parts().await?;
        }
        Ok(())
    }

    async fn upload_full_parts(&mut self) -> Result<()> {
        while self.buffer.len() as u64 >= self.block_size {
            let data = self.buffer.split_to(self.block_size as usize).freeze();
            if let Err(e) = self.upload_part(data).await {
                self.abort().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn upload_part(&mut self, data: Bytes) -> Result<()> {
        let store = &self.store;
        let path = &self.path;
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .retry
                    .run("create_multipart_upload", || store.create_multipart_upload(&path.bucket, &path.key))
                    .await?;
                tracing::debug!("Multipart upload started: {} upload_id={}", path, id);
                self.upload_id = Some(id.clone());
                id
            }
        };
        let part_number = self.parts.len() as u32 + 1;
        let part = self
            .retry
            .run("upload_part", || {
                store.upload_part(&path.bucket, &path.key, &upload_id, part_number, data.clone())
            })
            .await?;
        self.parts.push(part);
        Ok(())
    }

    /// Abort a started upload and mark the handle closed / 中止上传
    async fn abort(&mut self) {
        self.closed = true;
        self.buffer.clear();
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let store = &self.store;
        let path = &self.path;
        let result = self
            .retry
            .run("abort_multipart_upload", || {
                store.abort_multipart_upload(&path.bucket, &path.key, &upload_id)
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Abort of upload {} for {} failed: {}", upload_id, path, e);
        }
    }

    /// Drop buffered data and abort the upload / 放弃写入
    pub async fn discard(&mut self) {
        if self.mode == OpenMode::Write && !self.closed {
            self.abort().await;
        }
        self.closed = true;
    }

    /// Finish the file, the object becomes visible here / 关闭文件
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.mode == OpenMode::Read {
            self.closed = true;
            self.block = Bytes::new();
            return Ok(());
        }

        let result = self.commit().await;
        match result {
            Ok(()) => {
                self.closed = true;
                self.cache.invalidate(&self.path);
                Ok(())
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let data = self.buffer.split().freeze();
        let store = &self.store;
        let path = &self.path;

        if self.upload_id.is_none() {
            return self
                .retry
                .run("put_object", || store.put_object(&path.bucket, &path.key, data.clone()))
                .await;
        }

        if !data.is_empty() {
            self.upload_part(data).await?;
        }
        let store = &self.store;
        let path = &self.path;
        let Some(upload_id) = self.upload_id.clone() else {
            return Err(TosfsError::tosfs(format!("upload of {} lost its id", path)));
        };
        let parts = self.parts.clone();
        self.retry
            .run("complete_multipart_upload", || {
                store.complete_multipart_upload(&path.bucket, &path.key, &upload_id, parts.clone())
            })
            .await?;
        self.upload_id = None;
        tracing::debug!("Multipart upload completed: {} ({} parts)", path, self.parts.len());
        Ok(())
    }
}

impl<S: ObjectStore> Drop for TosFile<S> {
    fn drop(&mut self) {
        if self.closed || self.mode == OpenMode::Read {
            return;
        }
        tracing::warn!("{} dropped without close, written data is discarded", self.path);
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No runtime to abort upload {} of {}", upload_id, self.path);
            return;
        };
        let store = self.store.clone();
        let path = self.path.clone();
        handle.spawn(async move {
            if let Err(e) = store.abort_multipart_upload(&path.bucket, &path.key, &upload_id).await {
                tracing::error!("Abort of upload {} for {} failed: {}", upload_id, path, e);
            }
        });
    }
}
