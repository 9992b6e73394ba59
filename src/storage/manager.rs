use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;

use super::{ConfigItem, FileSystem};

pub type FsBox = Arc<Box<dyn FileSystem>>;

/// Filesystem factory trait / 文件系统工厂 trait
pub trait FsFactory: Send + Sync {
    /// Protocol served by this factory, e.g. `tos` / 协议名称
    fn protocol(&self) -> &'static str;

    /// 创建文件系统实例
    fn create_filesystem(&self, config: Value) -> Result<Box<dyn FileSystem>>;

    /// Short description / 简介
    fn description(&self) -> &'static str;

    /// Accepted config items / 配置项
    fn config_items(&self) -> Vec<ConfigItem>;

    /// Complete factory info / 工厂完整信息
    fn factory_info(&self) -> FactoryInfo {
        FactoryInfo {
            protocol: self.protocol().to_string(),
            description: self.description().to_string(),
            items: self.config_items(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryInfo {
    pub protocol: String,
    pub description: String,
    pub items: Vec<ConfigItem>,
}

struct Mount {
    protocol: String,
    fs: FsBox,
}

/// Filesystem registry (maps mounts such as `tos://` or `tos://bucket` to instances) / 文件系统注册表
#[derive(Clone)]
pub struct FsRegistry {
    mounts: Arc<RwLock<HashMap<String, Mount>>>,
    factories: Arc<RwLock<HashMap<String, Arc<Box<dyn FsFactory>>>>>,
}

impl Default for FsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a mount id into `protocol://path` / 规范化挂载点
fn normalize_mount(id: &str, default_protocol: &str) -> String {
    let (protocol, rest) = match id.split_once("://") {
        Some((protocol, rest)) => (protocol, rest),
        None => (default_protocol, id),
    };
    let rest = crate::utils::fix_and_clean_path(rest);
    if rest.is_empty() {
        format!("{}://", protocol)
    } else {
        format!("{}://{}", protocol, rest)
    }
}

impl FsRegistry {
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register filesystem factory / 注册文件系统工厂
    pub async fn register_factory(&self, factory: Box<dyn FsFactory>) -> Result<()> {
        let protocol = factory.protocol().to_string();

        let mut factories = self.factories.write().await;
        factories.insert(protocol.clone(), Arc::new(factory));

        tracing::info!("Filesystem factory registered: {}", protocol);
        Ok(())
    }

    /// Create filesystem instance and mount it at `id` / 创建文件系统实例
    /// `id` is `protocol://` or `protocol://bucket[/prefix]`.
    pub async fn create_filesystem(&self, id: &str, protocol: &str, config: Value) -> Result<String> {
        let factory = {
            let factories = self.factories.read().await;
            factories
                .get(protocol)
                .cloned()
                .ok_or_else(|| anyhow!("Filesystem protocol not found: {}", protocol))?
        };

        let mount = normalize_mount(id, protocol);
        match factory.create_filesystem(config) {
            Ok(fs) => {
                let mut mounts = self.mounts.write().await;
                mounts.insert(
                    mount.clone(),
                    Mount {
                        protocol: protocol.to_string(),
                        fs: Arc::new(fs),
                    },
                );
                tracing::info!("Filesystem created: {} ({})", mount, protocol);
                Ok(mount)
            }
            Err(e) => {
                tracing::error!("Filesystem creation failed: {} ({}) - {}", mount, protocol, e);
                Err(e)
            }
        }
    }

    /// Get filesystem instance / 获取文件系统实例
    pub async fn get(&self, id: &str) -> Option<FsBox> {
        let mount = normalize_mount(id, "tos");
        let mounts = self.mounts.read().await;
        mounts.get(&mount).map(|m| m.fs.clone())
    }

    /// Remove filesystem instance / 移除文件系统实例
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mount = normalize_mount(id, "tos");
        let mut mounts = self.mounts.write().await;
        mounts
            .remove(&mount)
            .ok_or_else(|| anyhow!("Filesystem not found: {}", mount))?;

        tracing::info!("Filesystem removed: {}", mount);
        Ok(())
    }

    /// List all mounts / 列出所有挂载点
    pub async fn list(&self) -> Vec<String> {
        let mounts = self.mounts.read().await;
        let mut ids: Vec<String> = mounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// List all available protocols / 列出所有可用协议
    pub async fn list_protocols(&self) -> Vec<String> {
        let factories = self.factories.read().await;
        let mut protocols: Vec<String> = factories.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub async fn factory_info(&self, protocol: &str) -> Option<FactoryInfo> {
        let factories = self.factories.read().await;
        factories.get(protocol).map(|f| f.factory_info())
    }

    /// Resolve a URL to its filesystem and stripped path / 解析URL到文件系统
    /// URLs without a scheme use `tos`. The longest matching mount wins.
    pub async fn resolve(&self, url: &str) -> Result<(FsBox, String)> {
        let target = normalize_mount(url, "tos");
        let mounts = self.mounts.read().await;

        let mut best_match: Option<(&String, &Mount)> = None;
        for (mount_id, mount) in mounts.iter() {
            let matches = target == *mount_id
                || mount_id.ends_with("://") && target.starts_with(mount_id.as_str())
                || target.starts_with(&format!("{}/", mount_id));
            if !matches {
                continue;
            }
            if best_match.map_or(true, |(best, _)| mount_id.len() > best.len()) {
                best_match = Some((mount_id, mount));
            }
        }

        let (_, mount) = best_match.ok_or_else(|| anyhow!("No filesystem mounted for {}", url))?;
        let stripped = mount.fs.normalize_path(&target);
        tracing::debug!("Resolved {} to {} ({})", url, stripped, mount.protocol);
        Ok((mount.fs.clone(), stripped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryFsFactory;
    use serde_json::json;

    #[test]
    fn test_normalize_mount() {
        assert_eq!(normalize_mount("tos://", "tos"), "tos://");
        assert_eq!(normalize_mount("bucket/dir/", "tos"), "tos://bucket/dir");
        assert_eq!(normalize_mount("memory://b", "tos"), "memory://b");
    }

    #[tokio::test]
    async fn test_resolve_longest_mount() {
        let registry = FsRegistry::new();
        registry.register_factory(Box::new(MemoryFsFactory)).await.unwrap();
        assert_eq!(registry.list_protocols().await, vec!["memory".to_string()]);

        registry
            .create_filesystem("memory://", "memory", json!({"buckets": ["a", "b"]}))
            .await
            .unwrap();
        registry
            .create_filesystem("memory://b", "memory", json!({"buckets": ["b"]}))
            .await
            .unwrap();

        let (fs, path) = registry.resolve("memory://a/x/y.txt").await.unwrap();
        assert_eq!(path, "a/x/y.txt");
        assert_eq!(fs.protocol(), "memory");

        let (wide, _) = registry.resolve("memory://a").await.unwrap();
        let (narrow, path) = registry.resolve("memory://b/file").await.unwrap();
        assert_eq!(path, "b/file");
        assert!(!Arc::ptr_eq(&wide, &narrow));

        assert!(registry.resolve("tos://bucket/key").await.is_err());
        assert!(registry.create_filesystem("s3://", "s3", json!({})).await.is_err());

        registry.remove("memory://b").await.unwrap();
        let (fallback, _) = registry.resolve("memory://b/file").await.unwrap();
        assert!(Arc::ptr_eq(&wide, &fallback));
        assert_eq!(registry.list().await, vec!["memory://".to_string()]);
    }

    #[tokio::test]
    async fn test_factory_info() {
        let registry = FsRegistry::new();
        registry.register_factory(Box::new(MemoryFsFactory)).await.unwrap();
        let info = registry.factory_info("memory").await.unwrap();
        assert_eq!(info.protocol, "memory");
        assert!(info.items.iter().any(|i| i.name == "buckets"));
        assert!(registry.factory_info("tos").await.is_none());
    }
}
