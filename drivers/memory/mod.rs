//! In-process object store / 内存对象存储
//!
//! Backs the `memory://` protocol and the test-suite. Behaves like an
//! S3-compatible endpoint: flat keys, delimiter listings with continuation
//! tokens, multipart uploads, and injectable failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;

use crate::config::FsOptions;
use crate::error::{Result, TosfsError};
use crate::fs::TosFileSystem;
use crate::retry::RetryPolicy;
use crate::storage::{
    BucketMeta, Capability, CompletedPart, ConfigItem, FileSystem, FsFactory, ListPage, ObjectMeta, ObjectStore,
};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// Memory object store / 内存对象存储
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, (DateTime<Utc>, BTreeMap<String, StoredObject>)>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<VecDeque<TosfsError>>,
    /// Per part number: fail with an error or stall before storing / 按分片号注入失败或延迟
    part_faults: Mutex<HashMap<u32, TosfsError>>,
    part_delays: Mutex<HashMap<u32, Duration>>,
    list_calls: AtomicU64,
    head_calls: AtomicU64,
    stored_parts: AtomicU64,
}

fn no_such_bucket(bucket: &str) -> TosfsError {
    TosfsError::server(404, "NoSuchBucket", format!("The specified bucket does not exist: {}", bucket))
}

fn new_etag() -> String {
    format!("\"{}\"", uuid::Uuid::new_v4().simple())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buckets(names: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut buckets = store.buckets.write();
            for name in names {
                buckets.insert(name.to_string(), (Utc::now(), BTreeMap::new()));
            }
        }
        store
    }

    /// Fail the next request with `err` / 让下一次请求失败
    pub fn inject_failure(&self, err: TosfsError) {
        self.faults.lock().push_back(err);
    }

    /// Fail every upload of `part_number` / 让指定分片上传失败
    pub fn fail_part(&self, part_number: u32, err: TosfsError) {
        self.part_faults.lock().insert(part_number, err);
    }

    /// Stall uploads of `part_number` before they are stored / 延迟指定分片
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.part_delays.lock().insert(part_number, delay);
    }

    /// Parts that reached the store / 已写入的分片数
    pub fn stored_parts(&self) -> u64 {
        self.stored_parts.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> u64 {
        self.head_calls.load(Ordering::SeqCst)
    }

    /// Multipart uploads not yet completed or aborted / 未完成的分片上传数
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    fn take_fault(&self) -> Result<()> {
        match self.faults.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn store_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let mut buckets = self.buckets.write();
        let (_, objects) = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag: new_etag(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn load_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let buckets = self.buckets.read();
        let (_, objects) = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects.get(key).cloned())
    }
}

fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
    ObjectMeta {
        key: key.to_string(),
        size: object.data.len() as u64,
        last_modified: Some(object.last_modified),
        etag: Some(object.etag.clone()),
        storage_class: Some("STANDARD".to_string()),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_range_read: true,
            can_append: false,
            can_multipart_upload: true,
            can_server_side_copy: true,
            can_batch_delete: true,
            can_create_bucket: true,
            min_part_size: None,
        }
    }

    async fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        self.take_fault()?;
        let buckets = self.buckets.read();
        Ok(buckets
            .iter()
            .map(|(name, (created, _))| BucketMeta {
                name: name.clone(),
                creation_date: Some(*created),
            })
            .collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.take_fault()?;
        Ok(self.buckets.read().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.take_fault()?;
        let mut buckets = self.buckets.write();
        if buckets.contains_key(bucket) {
            return Err(TosfsError::server(409, "BucketAlreadyExists", bucket));
        }
        buckets.insert(bucket.to_string(), (Utc::now(), BTreeMap::new()));
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;
        Ok(self.load_object(bucket, key)?.map(|object| meta(key, &object)))
    }

    async fn get_object(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        self.take_fault()?;
        let object = self
            .load_object(bucket, key)?
            .ok_or_else(|| TosfsError::server(404, "NoSuchKey", format!("{}/{}", bucket, key)))?;
        let len = object.data.len() as u64;
        match range {
            Some(range) => {
                let start = range.start.min(len) as usize;
                let end = range.end.min(len) as usize;
                Ok(object.data.slice(start..end.max(start)))
            }
            None => Ok(object.data),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        self.take_fault()?;
        self.store_object(bucket, key, data)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.take_fault()?;
        let mut buckets = self.buckets.write();
        let (_, objects) = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.take_fault()?;
        let mut buckets = self.buckets.write();
        let (_, objects) = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn copy_object(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<()> {
        self.take_fault()?;
        let object = self
            .load_object(src_bucket, src_key)?
            .ok_or_else(|| TosfsError::server(404, "NoSuchKey", format!("{}/{}", src_bucket, src_key)))?;
        self.store_object(dst_bucket, dst_key, object.data)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;
        let max_keys = max_keys.max(1);
        let buckets = self.buckets.read();
        let (_, objects) = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let mut page = ListPage::default();
        let mut emitted = 0usize;
        let mut last: Option<String> = None;
        let mut truncated = false;

        for (key, object) in objects.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(token) = &continuation_token {
                let inside_prefix = delimiter.map_or(false, |d| token.ends_with(d) && key.starts_with(token.as_str()));
                if key.as_str() <= token.as_str() || inside_prefix {
                    continue;
                }
            }

            let rest = &key[prefix.len()..];
            let common = delimiter.and_then(|d| rest.find(d).map(|idx| format!("{}{}", prefix, &rest[..idx + d.len()])));

            if let Some(common) = common {
                if page.common_prefixes.last() == Some(&common) {
                    continue;
                }
                if emitted == max_keys {
                    truncated = true;
                    break;
                }
                page.common_prefixes.push(common.clone());
                last = Some(common);
            } else {
                if emitted == max_keys {
                    truncated = true;
                    break;
                }
                page.objects.push(meta(key, object));
                last = Some(key.clone());
            }
            emitted += 1;
        }

        if truncated {
            page.next_token = last;
        }
        Ok(page)
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        self.take_fault()?;
        if !self.buckets.read().contains_key(bucket) {
            return Err(no_such_bucket(bucket));
        }
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        self.take_fault()?;
        if let Some(err) = self.part_faults.lock().remove(&part_number) {
            return Err(err);
        }
        let delay = self.part_delays.lock().get(&part_number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| TosfsError::server(404, "NoSuchUpload", upload_id))?;
        let etag = new_etag();
        upload.parts.insert(part_number, (etag.clone(), data));
        self.stored_parts.fetch_add(1, Ordering::SeqCst);
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.take_fault()?;
        let upload = {
            let mut uploads = self.uploads.lock();
            let owned = uploads
                .get(upload_id)
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if owned {
                uploads.remove(upload_id)
            } else {
                None
            }
        }
        .ok_or_else(|| TosfsError::server(404, "NoSuchUpload", upload_id))?;

        let mut data = BytesMut::new();
        let mut previous = 0u32;
        for part in &parts {
            if part.part_number <= previous {
                return Err(TosfsError::server(400, "InvalidPartOrder", upload_id));
            }
            previous = part.part_number;
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => return Err(TosfsError::server(400, "InvalidPart", upload_id)),
            }
        }
        self.store_object(bucket, key, data.freeze())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.take_fault()?;
        self.uploads.lock().remove(upload_id);
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct MemoryConfig {
    #[serde(default)]
    buckets: Vec<String>,
    #[serde(default)]
    fs: FsOptions,
}

/// Memory filesystem factory / 内存文件系统工厂
pub struct MemoryFsFactory;

impl FsFactory for MemoryFsFactory {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    fn create_filesystem(&self, config: Value) -> AnyResult<Box<dyn FileSystem>> {
        let config: MemoryConfig = if config.is_null() {
            MemoryConfig::default()
        } else {
            serde_json::from_value(config)?
        };
        let names: Vec<&str> = config.buckets.iter().map(String::as_str).collect();
        let store = MemoryStore::with_buckets(&names);
        Ok(Box::new(TosFileSystem::with_protocol(
            std::sync::Arc::new(store),
            config.fs,
            RetryPolicy::no_retry(),
            "memory",
        )))
    }

    fn description(&self) -> &'static str {
        "In-process object store, contents are lost on exit"
    }

    fn config_items(&self) -> Vec<ConfigItem> {
        vec![ConfigItem::new("buckets", "array").help("Buckets created at start-up")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_with_delimiter_pages() {
        let store = MemoryStore::with_buckets(&["b"]);
        for key in ["a/1", "a/2", "b/x/1", "b/x/2", "b/y", "c"] {
            store.put_object("b", key, Bytes::from_static(b"x")).await.unwrap();
        }

        let page = store.list_objects("b", "", Some("/"), None, 2).await.unwrap();
        assert_eq!(page.common_prefixes, vec!["a/", "b/"]);
        assert!(page.objects.is_empty());
        let token = page.next_token.clone().unwrap();

        let page = store.list_objects("b", "", Some("/"), Some(token), 2).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "c");
        assert!(page.next_token.is_none());

        let page = store.list_objects("b", "b/", Some("/"), None, 10).await.unwrap();
        assert_eq!(page.common_prefixes, vec!["b/x/"]);
        assert_eq!(page.objects[0].key, "b/y");
    }

    #[tokio::test]
    async fn test_missing_bucket_and_key() {
        let store = MemoryStore::with_buckets(&["b"]);
        let err = store.list_objects("nope", "", None, None, 10).await.unwrap_err();
        assert!(matches!(err, TosfsError::Server { status: 404, ref code, .. } if code == "NoSuchBucket"));
        assert!(store.head_object("b", "missing").await.unwrap().is_none());
        assert!(store.get_object("b", "missing", None).await.unwrap_err().is_not_found());
        store.delete_object("b", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let store = MemoryStore::with_buckets(&["b"]);
        let id = store.create_multipart_upload("b", "big").await.unwrap();
        let p1 = store.upload_part("b", "big", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();
        let p2 = store.upload_part("b", "big", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(store.pending_uploads(), 1);
        assert_ne!(p1.etag, p2.etag);
        assert!(p1.etag.starts_with('"') && p1.etag.ends_with('"'));
        assert_ne!(store.create_multipart_upload("b", "other").await.unwrap(), id);
        assert_eq!(store.stored_parts(), 2);
        store.complete_multipart_upload("b", "big", &id, vec![p1, p2]).await.unwrap();
        assert_eq!(store.pending_uploads(), 1);
        let data = store.get_object("b", "big", Some(3..8)).await.unwrap();
        assert_eq!(&data[..], b"lo wo");
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let store = MemoryStore::with_buckets(&["b"]);
        store.inject_failure(TosfsError::server(503, "ServiceUnavailable", "busy"));
        assert!(store.bucket_exists("b").await.is_err());
        assert!(store.bucket_exists("b").await.unwrap());
    }
}
