//! Directory listing emulation / 目录列举模拟
//!
//! Turns prefix/delimiter listings into directory entries. Common prefixes
//! and `key/` markers become directories; a file that shares its name with a
//! directory is hidden behind it.

use std::collections::{BTreeMap, BTreeSet};

use super::path::TosPath;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::storage::{ObjectInfo, ObjectMeta, ObjectStore};

pub const DELIMITER: &str = "/";

pub fn file_info(bucket: &str, meta: &ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        name: format!("{}/{}", bucket, meta.key),
        size: meta.size,
        kind: crate::storage::ObjectKind::File,
        last_modified: meta.last_modified,
        etag: meta.etag.clone(),
        storage_class: meta.storage_class.clone(),
    }
}

/// List one directory level, following continuation tokens / 列出一层目录
pub async fn list_dir<S: ObjectStore + ?Sized>(
    store: &S,
    retry: &RetryPolicy,
    path: &TosPath,
    page_size: usize,
) -> Result<Vec<ObjectInfo>> {
    let prefix = path.dir_key();
    let mut files: BTreeMap<String, ObjectInfo> = BTreeMap::new();
    let mut dirs: BTreeMap<String, ObjectInfo> = BTreeMap::new();
    let mut token: Option<String> = None;

    loop {
        let page = retry
            .run("list_objects", || {
                store.list_objects(&path.bucket, &prefix, Some(DELIMITER), token.clone(), page_size)
            })
            .await?;

        for common in &page.common_prefixes {
            let key = common.trim_end_matches('/');
            if key.is_empty() {
                continue;
            }
            let name = format!("{}/{}", path.bucket, key);
            dirs.insert(name.clone(), ObjectInfo::directory(name));
        }
        for object in &page.objects {
            if object.key == prefix {
                continue;
            }
            if object.key.ends_with('/') {
                let name = format!("{}/{}", path.bucket, object.key.trim_end_matches('/'));
                dirs.insert(name.clone(), ObjectInfo::directory(name));
            } else {
                let info = file_info(&path.bucket, object);
                files.insert(info.name.clone(), info);
            }
        }

        token = page.next_token;
        if token.is_none() {
            break;
        }
    }

    for name in dirs.keys() {
        if files.remove(name).is_some() {
            tracing::warn!("{} exists both as a file and as a directory, listing the directory", name);
        }
    }
    files.extend(dirs);
    Ok(files.into_values().collect())
}

/// List all buckets of the account / 列出全部桶
pub async fn list_buckets<S: ObjectStore + ?Sized>(store: &S, retry: &RetryPolicy) -> Result<Vec<ObjectInfo>> {
    let mut buckets = retry.run("list_buckets", || store.list_buckets()).await?;
    buckets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(buckets
        .into_iter()
        .map(|b| {
            let mut info = ObjectInfo::bucket(b.name);
            info.last_modified = b.creation_date;
            info
        })
        .collect())
}

/// Flat listing of every key below a path / 递归列出全部对象
pub async fn list_recursive<S: ObjectStore + ?Sized>(
    store: &S,
    retry: &RetryPolicy,
    path: &TosPath,
    page_size: usize,
) -> Result<Vec<ObjectMeta>> {
    let prefix = path.dir_key();
    let mut out = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = retry
            .run("list_objects", || {
                store.list_objects(&path.bucket, &prefix, None, token.clone(), page_size)
            })
            .await?;
        out.extend(page.objects);
        token = page.next_token;
        if token.is_none() {
            break;
        }
    }
    Ok(out)
}

/// Derive files and pseudo-directories from a flat listing / 由扁平列表推导目录树
/// Depth 1 is a direct child of `base`.
pub fn synthesize_tree(
    base: &TosPath,
    objects: &[ObjectMeta],
    maxdepth: Option<usize>,
    withdirs: bool,
) -> BTreeMap<String, ObjectInfo> {
    let prefix = base.dir_key();
    let within = |depth: usize| maxdepth.map_or(true, |max| depth <= max);

    // every directory implied by the listing, regardless of depth
    let mut all_dirs: BTreeMap<String, usize> = BTreeMap::new();
    for object in objects {
        let Some(rel) = object.key.strip_prefix(&prefix) else {
            continue;
        };
        let segments: Vec<&str> = rel.trim_end_matches('/').split('/').collect();
        if rel.is_empty() {
            continue;
        }
        let dir_segments = if rel.ends_with('/') {
            segments.len()
        } else {
            segments.len() - 1
        };
        for depth in 1..=dir_segments {
            let key = format!("{}{}", prefix, segments[..depth].join("/"));
            all_dirs.entry(format!("{}/{}", base.bucket, key)).or_insert(depth);
        }
    }

    let mut out = BTreeMap::new();
    for object in objects {
        let Some(rel) = object.key.strip_prefix(&prefix) else {
            continue;
        };
        if rel.is_empty() || rel.ends_with('/') {
            continue;
        }
        let depth = rel.split('/').count();
        let info = file_info(&base.bucket, object);
        if !within(depth) {
            continue;
        }
        if all_dirs.contains_key(&info.name) {
            tracing::warn!("{} exists both as a file and as a directory, listing the directory", info.name);
            continue;
        }
        out.insert(info.name.clone(), info);
    }

    if withdirs {
        for (name, depth) in all_dirs {
            if within(depth) {
                out.insert(name.clone(), ObjectInfo::directory(name));
            }
        }
    }
    out
}

/// Distinct directory names implied by a flat listing, deepest first / 推导出的目录，深度优先
pub fn implied_dirs(base: &TosPath, objects: &[ObjectMeta]) -> Vec<String> {
    let tree = synthesize_tree(base, objects, None, true);
    let mut dirs: BTreeSet<(usize, String)> = BTreeSet::new();
    for info in tree.values().filter(|i| i.is_dir()) {
        dirs.insert((info.name.matches('/').count(), info.name.clone()));
    }
    dirs.into_iter().rev().map(|(_, name)| name).collect()
}
