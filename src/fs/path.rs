//! Path translation / 路径转换
//!
//! Maps `tos://bucket/key`, `bucket/key` and access-point ARNs onto
//! `(bucket, key)` pairs.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::fix_and_clean_path;

const PROTOCOLS: [&str; 3] = ["tos://", "tosfs://", "tos:"];

static BUCKET_FORMATS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^(?P<bucket>:tos:[a-z\-0-9]*:[0-9]{12}:accesspoint[:/][^/]+)/?(?P<key>.*)$",
        r"^(?P<bucket>:tos-outposts:[a-z\-0-9]+:[0-9]{12}:outpost[/:][a-zA-Z0-9\-]{1,63}[/:](bucket|accesspoint)[/:][a-zA-Z0-9\-]{1,63})[/:]?(?P<key>.*)$",
        r"^(?P<bucket>:tos-outposts:[a-z\-0-9]+:[0-9]{12}:outpost[/:][a-zA-Z0-9\-]{1,63}[/:]bucket[/:][a-zA-Z0-9\-]{1,63})[/:]?(?P<key>.*)$",
        r"^(?P<bucket>:tos-object-lambda:[a-z\-0-9]+:[0-9]{12}:accesspoint[/:][a-zA-Z0-9\-]{1,63})[/:]?(?P<key>.*)$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Remove the protocol prefix and normalize separators / 去掉协议前缀并规范化
pub fn strip_protocol(path: &str) -> String {
    let trimmed = path.trim();
    let without = PROTOCOLS
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);
    fix_and_clean_path(without)
}

/// Split a stripped path into bucket and key / 拆分桶名与对象键
pub fn find_bucket_key(path: &str) -> (String, String) {
    for format in BUCKET_FORMATS.iter() {
        if let Some(caps) = format.captures(path) {
            let bucket = caps.name("bucket").map(|m| m.as_str()).unwrap_or_default();
            let key = caps.name("key").map(|m| m.as_str()).unwrap_or_default();
            return (bucket.to_string(), key.trim_matches('/').to_string());
        }
    }
    match path.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.trim_matches('/').to_string()),
        None => (path.to_string(), String::new()),
    }
}

/// Parent of a stripped path, "" for a bucket / 父路径
pub fn parent_path(path: &str) -> String {
    let path = strip_protocol(path);
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// A location in the object store / 对象存储中的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TosPath {
    pub bucket: String,
    pub key: String,
}

impl TosPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into().trim_matches('/').to_string(),
        }
    }

    pub fn parse(path: &str) -> Self {
        let stripped = strip_protocol(path);
        let (bucket, key) = find_bucket_key(&stripped);
        Self { bucket, key }
    }

    /// Service root, lists buckets / 根路径
    pub fn is_root(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn is_bucket(&self) -> bool {
        !self.bucket.is_empty() && self.key.is_empty()
    }

    pub fn join(&self, name: &str) -> Self {
        let name = name.trim_matches('/');
        if self.is_root() {
            return Self::parse(name);
        }
        if self.key.is_empty() {
            Self::new(self.bucket.clone(), name)
        } else {
            Self::new(self.bucket.clone(), format!("{}/{}", self.key, name))
        }
    }

    pub fn parent(&self) -> Self {
        if self.key.is_empty() {
            return Self::default();
        }
        match self.key.rsplit_once('/') {
            Some((parent, _)) => Self::new(self.bucket.clone(), parent),
            None => Self::new(self.bucket.clone(), ""),
        }
    }

    /// Last path segment / 最后一段名称
    pub fn name(&self) -> &str {
        if self.key.is_empty() {
            return &self.bucket;
        }
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Key of the directory marker, also the listing prefix / 目录标记键
    pub fn dir_key(&self) -> String {
        if self.key.is_empty() {
            String::new()
        } else {
            format!("{}/", self.key)
        }
    }

    /// This path and all of its ancestors up to the root / 自身及全部祖先
    pub fn ancestors(&self) -> Vec<TosPath> {
        let mut out = vec![self.clone()];
        let mut current = self.clone();
        while !current.is_root() {
            current = current.parent();
            out.push(current.clone());
        }
        out
    }
}

impl fmt::Display for TosPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_protocol() {
        let cases = vec![
            ("tos://bucket/key", "bucket/key"),
            ("tosfs://bucket/dir/", "bucket/dir"),
            ("tos:bucket", "bucket"),
            ("/bucket//a/b/", "bucket/a/b"),
            ("bucket\\a", "bucket/a"),
            ("", ""),
            ("/", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(strip_protocol(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_find_bucket_key() {
        assert_eq!(
            find_bucket_key("bucket/a/b.txt"),
            ("bucket".to_string(), "a/b.txt".to_string())
        );
        assert_eq!(find_bucket_key("bucket"), ("bucket".to_string(), String::new()));

        let (bucket, key) = find_bucket_key(":tos:cn-beijing:123456789012:accesspoint/ap-1/dir/file");
        assert_eq!(bucket, ":tos:cn-beijing:123456789012:accesspoint/ap-1");
        assert_eq!(key, "dir/file");

        let (bucket, key) = find_bucket_key(
            ":tos-object-lambda:cn-beijing:123456789012:accesspoint/my-lambda/obj",
        );
        assert_eq!(bucket, ":tos-object-lambda:cn-beijing:123456789012:accesspoint/my-lambda");
        assert_eq!(key, "obj");
    }

    #[test]
    fn test_tos_path() {
        let p = TosPath::parse("tos://bucket/a/b/c.txt");
        assert_eq!(p.bucket, "bucket");
        assert_eq!(p.key, "a/b/c.txt");
        assert_eq!(p.name(), "c.txt");
        assert_eq!(p.dir_key(), "a/b/c.txt/");
        assert_eq!(p.parent().to_string(), "bucket/a/b");
        assert_eq!(p.to_string(), "bucket/a/b/c.txt");
        assert!(!p.is_bucket());

        let b = TosPath::parse("bucket/");
        assert!(b.is_bucket());
        assert_eq!(b.dir_key(), "");
        assert_eq!(b.name(), "bucket");
        assert!(b.parent().is_root());
        assert_eq!(b.join("x/").to_string(), "bucket/x");

        assert!(TosPath::parse("").is_root());
        assert_eq!(TosPath::default().join("bucket").to_string(), "bucket");
    }

    #[test]
    fn test_ancestors_and_parent_path() {
        let names: Vec<String> = TosPath::parse("bucket/a/b")
            .ancestors()
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(names, vec!["bucket/a/b", "bucket/a", "bucket", ""]);

        assert_eq!(parent_path("tos://bucket/a/b"), "bucket/a");
        assert_eq!(parent_path("bucket"), "");
    }
}
