//! Object store client interface / 对象存储客户端接口
//!
//! The seam between the filesystem adapter and an S3-compatible SDK. Paths
//! here are raw `(bucket, key)` pairs; no directory semantics apply.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::Capability;
use crate::error::{Result, TosfsError};

/// Concurrent single deletes when a backend has no batch delete / 并发删除数
const DELETE_CONCURRENCY: usize = 8;

/// Object metadata returned by HEAD and LIST / 对象元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
}

impl ObjectMeta {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
            storage_class: None,
        }
    }
}

/// One page of a prefix listing / 列举结果的一页
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Common prefixes, each ending with the delimiter / 公共前缀
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMeta {
    pub name: String,
    pub creation_date: Option<DateTime<Utc>>,
}

/// Uploaded multipart part / 已上传的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Client name, used in logs / 客户端名称
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capability;

    async fn list_buckets(&self) -> Result<Vec<BucketMeta>>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        Err(TosfsError::Unsupported(format!("create bucket {} on {}", bucket, self.name())))
    }

    /// HEAD an object, None when it does not exist / 获取对象元数据
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// GET an object or a half-open byte range of it / 读取对象
    async fn get_object(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> Result<Bytes>;

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    /// Delete one object, succeeds when it is already gone / 删除对象
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete several objects (default loops over `delete_object`) / 批量删除
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let deletes: Vec<_> = keys.iter().map(|key| self.delete_object(bucket, key)).collect();
        stream::iter(deletes)
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn copy_object(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<()>;

    /// List keys under `prefix`, grouped by `delimiter` / 按前缀列举
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage>;

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
