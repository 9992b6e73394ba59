//! TOS对象存储客户端
//!
//! 通过TOS的S3兼容接口访问对象存储，只提供原语；
//! 目录语义由 `TosFileSystem` 负责。

use std::collections::HashMap;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use s3::bucket::Bucket;
use s3::bucket_ops::BucketConfiguration;
use s3::creds::Credentials;
use s3::serde_types::Part;
use s3::Region;

use crate::config::MIN_PART_SIZE;
use crate::error::{Result, TosfsError};
use crate::storage::object::{BucketMeta, CompletedPart, ListPage, ObjectMeta, ObjectStore};
use crate::storage::Capability;

use super::config::TosConfig;
use super::error::{is_missing, map_s3_error, parse_timestamp};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// TOS客户端
pub struct TosStore {
    config: TosConfig,
    region: Region,
    credentials: Credentials,
    /// 按桶名缓存的客户端
    buckets: Mutex<HashMap<String, Box<Bucket>>>,
}

impl TosStore {
    pub fn new(config: TosConfig) -> Result<Self> {
        let (access_key, secret_key, token) = config.credentials()?;
        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, token.as_deref(), None)
            .map_err(|e| TosfsError::Credentials(format!("创建TOS凭证失败: {}", e)))?;
        let region = Region::Custom {
            region: config.region(),
            endpoint: config.endpoint(),
        };
        tracing::debug!("TOS client: endpoint={}, region={}", config.endpoint(), config.region());
        Ok(Self {
            config,
            region,
            credentials,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TosConfig {
        &self.config
    }

    /// 获取桶客户端
    fn bucket(&self, name: &str) -> Result<Box<Bucket>> {
        if let Some(bucket) = self.buckets.lock().get(name) {
            return Ok(bucket.clone());
        }
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| TosfsError::tosfs(format!("创建TOS Bucket失败: {}", e)))?;
        let bucket = if self.config.force_path_style {
            bucket.with_path_style()
        } else {
            bucket
        };
        self.buckets.lock().insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }
}

fn content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

fn expect_success(status: u16, op: &str, body: &[u8]) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        tracing::debug!("TOS {} returned {}", op, status);
        Err(super::error::server_error(status, &String::from_utf8_lossy(body)))
    }
}

#[async_trait]
impl ObjectStore for TosStore {
    fn name(&self) -> &str {
        "tos"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_range_read: true,
            can_append: false,
            can_multipart_upload: true,
            can_server_side_copy: true,
            can_batch_delete: false,
            can_create_bucket: true,
            min_part_size: Some(MIN_PART_SIZE),
        }
    }

    async fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        let response = Bucket::list_buckets(self.region.clone(), self.credentials.clone())
            .await
            .map_err(map_s3_error)?;
        Ok(response
            .bucket_names()
            .map(|name| BucketMeta {
                name,
                creation_date: None,
            })
            .collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let client = self.bucket(bucket)?;
        match client.list_page(String::new(), None, None, None, Some(1)).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(map_s3_error(e)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let config = BucketConfiguration::default();
        let response = if self.config.force_path_style {
            Bucket::create_with_path_style(bucket, self.region.clone(), self.credentials.clone(), config).await
        } else {
            Bucket::create(bucket, self.region.clone(), self.credentials.clone(), config).await
        }
        .map_err(map_s3_error)?;
        expect_success(response.response_code, "CreateBucket", response.response_text.as_bytes())?;
        tracing::info!("TOS bucket created: {}", bucket);
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let client = self.bucket(bucket)?;
        match client.head_object(key).await {
            Ok((head, _)) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: head.content_length.unwrap_or(0).max(0) as u64,
                last_modified: head.last_modified.as_deref().and_then(parse_timestamp),
                etag: head.e_tag,
                storage_class: head.storage_class,
            })),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(map_s3_error(e)),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        let client = self.bucket(bucket)?;
        let response = match range {
            None => client.get_object(key).await,
            Some(range) if range.start >= range.end => return Ok(Bytes::new()),
            Some(range) => client.get_object_range(key, range.start, Some(range.end - 1)).await,
        }
        .map_err(map_s3_error)?;
        Ok(response.bytes().clone())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let client = self.bucket(bucket)?;
        let response = client
            .put_object_with_content_type(key, &data, &content_type(key))
            .await
            .map_err(map_s3_error)?;
        expect_success(response.status_code(), "PutObject", response.bytes())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let client = self.bucket(bucket)?;
        match client.delete_object(key).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(map_s3_error(e)),
        }
    }

    async fn copy_object(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<()> {
        if src_bucket != dst_bucket {
            // 跨桶复制：下载后上传
            let data = self.get_object(src_bucket, src_key, None).await?;
            return self.put_object(dst_bucket, dst_key, data).await;
        }
        let client = self.bucket(src_bucket)?;
        // copy_object_internal的from参数需要URL编码（中文等非ASCII字符）
        let encoded_src = urlencoding::encode(src_key);
        tracing::debug!("TOS CopyObject: src_key={}, dst_key={}", src_key, dst_key);
        let status = client
            .copy_object_internal(encoded_src.as_ref(), dst_key)
            .await
            .map_err(map_s3_error)?;
        expect_success(status, "CopyObject", &[])
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let client = self.bucket(bucket)?;
        let (result, _) = client
            .list_page(
                prefix.to_string(),
                delimiter.map(str::to_string),
                continuation_token,
                None,
                Some(max_keys.max(1)),
            )
            .await
            .map_err(map_s3_error)?;

        let objects = result
            .contents
            .into_iter()
            .map(|object| ObjectMeta {
                last_modified: parse_timestamp(&object.last_modified),
                etag: object.e_tag,
                storage_class: object.storage_class,
                size: object.size,
                key: object.key,
            })
            .collect();
        let common_prefixes = result
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.prefix)
            .collect();
        let next_token = if result.is_truncated {
            result.next_continuation_token
        } else {
            None
        };
        Ok(ListPage {
            objects,
            common_prefixes,
            next_token,
        })
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let client = self.bucket(bucket)?;
        let response = client
            .initiate_multipart_upload(key, &content_type(key))
            .await
            .map_err(map_s3_error)?;
        tracing::debug!("TOS multipart upload started: {}/{} id={}", bucket, key, response.upload_id);
        Ok(response.upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let client = self.bucket(bucket)?;
        let part = client
            .put_multipart_chunk(data.to_vec(), key, part_number, upload_id, &content_type(key))
            .await
            .map_err(map_s3_error)?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let client = self.bucket(bucket)?;
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        client
            .complete_multipart_upload(key, upload_id, parts)
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let client = self.bucket(bucket)?;
        match client.abort_upload(key, upload_id).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(map_s3_error(e)),
        }
    }
}
