//! TOS 对象存储驱动
//!
//! 通过S3兼容接口访问火山引擎TOS

mod config;
mod driver;
mod error;

pub use config::{TosConfig, DEFAULT_REGION};
pub use driver::TosStore;
pub use error::{classify_client_error, map_s3_error, parse_timestamp, server_error};

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::TosfsConfig;
use crate::fs::TosFileSystem;
use crate::storage::{ConfigItem, FileSystem, FsFactory};

/// TOS 文件系统工厂
pub struct TosFsFactory;

impl TosFsFactory {
    /// Resolve a mount config, gaps are filled from the global config / 解析挂载配置
    pub fn resolve_config(config: Value) -> Result<TosConfig> {
        Self::resolve_config_with(config, &crate::config::config())
    }

    /// Resolve against an explicit base config / 基于指定全局配置解析
    pub fn resolve_config_with(config: Value, global: &TosfsConfig) -> Result<TosConfig> {
        let global = TosConfig::from_global(global);
        if config.is_null() {
            return Ok(global);
        }
        let config: TosConfig = serde_json::from_value(config).map_err(|e| anyhow!("配置解析失败: {}", e))?;
        Ok(config.or_from(&global))
    }
}

impl FsFactory for TosFsFactory {
    fn protocol(&self) -> &'static str {
        "tos"
    }

    fn create_filesystem(&self, config: Value) -> Result<Box<dyn FileSystem>> {
        let config = Self::resolve_config(config)?;
        let fs_options = config.fs_options();
        let retry = config.retry_policy();
        let store = TosStore::new(config)?;
        Ok(Box::new(TosFileSystem::new(Arc::new(store), fs_options, retry)))
    }

    fn description(&self) -> &'static str {
        "Volcengine TOS object storage (S3 compatible API)"
    }

    fn config_items(&self) -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("endpoint", "string")
                .help("S3兼容端点，如 https://tos-s3-cn-beijing.volces.com，为空时由区域推导"),
            ConfigItem::new("region", "string").default(DEFAULT_REGION),
            ConfigItem::new("access_key", "string").required().help("Access Key (TOS_ACCESS_KEY)"),
            ConfigItem::new("secret_key", "password").required().help("Secret Key (TOS_SECRET_KEY)"),
            ConfigItem::new("session_token", "password").help("临时凭证的Session Token"),
            ConfigItem::new("force_path_style", "bool")
                .default("false")
                .help("使用路径风格访问"),
        ]
    }
}
