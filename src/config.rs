//! Configuration module / 配置模块
//!
//! Loaded from an optional JSON file (`TOSFS_CONFIG`, else `tosfs.json` in the
//! working directory) and overlaid by the `TOS_*` environment variables.

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::retry::RetryPolicy;

pub const ENV_NAME_TOS_ACCESS_KEY: &str = "TOS_ACCESS_KEY";
pub const ENV_NAME_TOS_SECRET_KEY: &str = "TOS_SECRET_KEY";
pub const ENV_NAME_TOS_SESSION_TOKEN: &str = "TOS_SESSION_TOKEN";
pub const ENV_NAME_TOS_REGION: &str = "TOS_REGION";
pub const ENV_NAME_TOS_ENDPOINT: &str = "TOS_ENDPOINT";
pub const ENV_NAME_TOS_BUCKET: &str = "TOS_BUCKET";
pub const ENV_NAME_TOSFS_LOGGING_LEVEL: &str = "TOSFS_LOGGING_LEVEL";
pub const ENV_NAME_TOSFS_CONFIG: &str = "TOSFS_CONFIG";

/// Minimum size of a non-final multipart part / 分片最小大小
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Global configuration instance / 全局配置实例
static CONFIG: OnceCell<Arc<RwLock<TosfsConfig>>> = OnceCell::new();

/// Application configuration / 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TosfsConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Default bucket for relative CLI paths and live tests / 默认桶
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
    #[serde(default)]
    pub fs: FsOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Access credentials / 访问凭证
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Filesystem behaviour / 文件系统行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsOptions {
    /// Read block and write part size / 读写块大小
    #[serde(default = "default_block_size")]
    pub default_block_size: u64,
    /// Lower bound for multipart parts / 分片下限
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    /// Keys per list request / 每次列举的最大键数
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_true")]
    pub listings_cache: bool,
    /// Listing cache TTL in seconds, None never expires / 缓存过期时间
    #[serde(default = "default_listings_expiry")]
    pub listings_expiry_time: Option<u64>,
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
    /// Concurrent requests for recursive copies and deletes / 并发数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_logging_level() -> String {
    "INFO".to_string()
}

fn default_block_size() -> u64 {
    MIN_PART_SIZE
}

fn default_min_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_list_page_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_listings_expiry() -> Option<u64> {
    Some(30)
}

fn default_max_paths() -> usize {
    1000
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for TosfsConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialsConfig::default(),
            endpoint: None,
            region: None,
            bucket: None,
            logging_level: default_logging_level(),
            fs: FsOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            default_block_size: default_block_size(),
            min_part_size: default_min_part_size(),
            list_page_size: default_list_page_size(),
            listings_cache: default_true(),
            listings_expiry_time: default_listings_expiry(),
            max_paths: default_max_paths(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl TosfsConfig {
    /// Overlay environment variables / 用环境变量覆盖配置
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = get(ENV_NAME_TOS_ACCESS_KEY) {
            self.credentials.access_key = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOS_SECRET_KEY) {
            self.credentials.secret_key = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOS_SESSION_TOKEN) {
            self.credentials.session_token = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOS_REGION) {
            self.region = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOS_ENDPOINT) {
            self.endpoint = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOS_BUCKET) {
            self.bucket = Some(v);
        }
        if let Some(v) = get(ENV_NAME_TOSFS_LOGGING_LEVEL) {
            self.logging_level = v;
        }
    }

    /// Whether an access key pair is available / 是否已配置访问密钥
    pub fn has_credentials(&self) -> bool {
        self.credentials.access_key.is_some() && self.credentials.secret_key.is_some()
    }
}

/// Get the config file path / 获取配置文件路径
fn get_config_path() -> PathBuf {
    match std::env::var(ENV_NAME_TOSFS_CONFIG) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("tosfs.json"),
    }
}

/// Load configuration from file and environment / 加载配置文件和环境变量
pub fn load_config() -> Result<TosfsConfig, String> {
    load_config_from(&get_config_path(), |name| std::env::var(name).ok())
}

/// Load `config_path` when it exists, then overlay `lookup` / 从指定文件加载并叠加环境变量
pub fn load_config_from(
    config_path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TosfsConfig, String> {
    let mut config = if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: TosfsConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        config
    } else {
        TosfsConfig::default()
    };

    config.apply_env_from(lookup);
    Ok(config)
}

/// Initialize global configuration / 初始化全局配置
pub fn init_config() -> Result<Arc<RwLock<TosfsConfig>>, String> {
    let config = load_config()?;

    let config_arc = Arc::new(RwLock::new(config));

    CONFIG
        .set(config_arc.clone())
        .map_err(|_| "Config already initialized".to_string())?;

    Ok(config_arc)
}

/// Get global configuration instance / 获取全局配置实例
pub fn get_config() -> Arc<RwLock<TosfsConfig>> {
    CONFIG
        .get_or_init(|| {
            let config = load_config().unwrap_or_else(|e| {
                tracing::warn!("{}, using defaults", e);
                let mut config = TosfsConfig::default();
                config.apply_env();
                config
            });
            Arc::new(RwLock::new(config))
        })
        .clone()
}

/// Get a read-only snapshot of current config / 获取当前配置的只读快照
pub fn config() -> TosfsConfig {
    get_config().read().clone()
}
