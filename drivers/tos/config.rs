//! TOS驱动配置

use serde::{Deserialize, Serialize};

use crate::config::{FsOptions, TosfsConfig};
use crate::error::{Result, TosfsError};
use crate::retry::RetryPolicy;

pub const DEFAULT_REGION: &str = "cn-beijing";

/// TOS配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TosConfig {
    /// S3兼容端点地址，如 https://tos-s3-cn-beijing.volces.com
    /// 为空时由区域推导
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 区域
    #[serde(default)]
    pub region: Option<String>,
    /// Access Key
    #[serde(default)]
    pub access_key: Option<String>,
    /// Secret Key
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Session Token（用于临时凭证）
    #[serde(default)]
    pub session_token: Option<String>,
    /// 强制使用路径风格（而非虚拟主机风格）
    #[serde(default)]
    pub force_path_style: bool,
    /// 为空时沿用全局配置
    #[serde(default)]
    pub fs: Option<FsOptions>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl TosConfig {
    /// Build from the process-wide configuration / 由全局配置生成
    pub fn from_global(config: &TosfsConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            access_key: config.credentials.access_key.clone(),
            secret_key: config.credentials.secret_key.clone(),
            session_token: config.credentials.session_token.clone(),
            force_path_style: false,
            fs: Some(config.fs.clone()),
            retry: Some(config.retry.clone()),
        }
    }

    /// Fill unset fields from `other` / 用另一份配置补全缺失字段
    pub fn or_from(mut self, other: &TosConfig) -> Self {
        self.fs = self.fs.or_else(|| other.fs.clone());
        self.retry = self.retry.or_else(|| other.retry.clone());
        self.endpoint = self.endpoint.or_else(|| other.endpoint.clone());
        self.region = self.region.or_else(|| other.region.clone());
        self.access_key = self.access_key.or_else(|| other.access_key.clone());
        self.secret_key = self.secret_key.or_else(|| other.secret_key.clone());
        self.session_token = self.session_token.or_else(|| other.session_token.clone());
        self
    }

    pub fn fs_options(&self) -> FsOptions {
        self.fs.clone().unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub fn region(&self) -> String {
        self.region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Endpoint with scheme / 带协议的端点
    pub fn endpoint(&self) -> String {
        match self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) if endpoint.contains("://") => endpoint.trim_end_matches('/').to_string(),
            Some(endpoint) => format!("https://{}", endpoint.trim_end_matches('/')),
            None => format!("https://tos-s3-{}.volces.com", self.region()),
        }
    }

    /// Access key pair, the token is optional / 访问密钥
    pub fn credentials(&self) -> Result<(String, String, Option<String>)> {
        let access_key = self.access_key.clone().filter(|v| !v.is_empty());
        let secret_key = self.secret_key.clone().filter(|v| !v.is_empty());
        match (access_key, secret_key) {
            (Some(ak), Some(sk)) => Ok((ak, sk, self.session_token.clone().filter(|v| !v.is_empty()))),
            _ => Err(TosfsError::Credentials(
                "access key and secret key are required (TOS_ACCESS_KEY / TOS_SECRET_KEY)".to_string(),
            )),
        }
    }
}
