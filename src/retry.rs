//! Retry policy for object-store requests / 对象存储请求重试策略
//!
//! Server errors are retried for 409 (except the conflict codes below), 429,
//! 500 and 503. Client errors are retried when the request failed in
//! transport. Backoff doubles from `sleep_base` up to `sleep_max`; 429 and 503
//! responses honour `Retry-After`.

use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientErrorKind, Result, TosfsError};

pub const CONFLICT_CODE: u16 = 409;
pub const TOO_MANY_REQUESTS_CODE: u16 = 429;
pub const INTERNAL_SERVER_ERROR_CODE: u16 = 500;
pub const SERVICE_UNAVAILABLE_CODE: u16 = 503;

pub const MAX_RETRY_NUM: u32 = 20;
const SLEEP_BASE_MILLIS: u64 = 100;
const SLEEP_MAX_SECONDS: u64 = 60;

const RETRYABLE_SERVER_STATUS_CODES: [u16; 4] = [
    CONFLICT_CODE,
    TOO_MANY_REQUESTS_CODE,
    INTERNAL_SERVER_ERROR_CODE,
    SERVICE_UNAVAILABLE_CODE,
];

/// Conflict codes that fail fast / 不重试的冲突错误码
const NOT_RETRYABLE_CONFLICT_ERROR_CODES: [&str; 9] = [
    "0026-00000013", // DELETE_NON_EMPTY_DIR
    "0026-00000020", // LOCATED_UNDER_A_FILE
    "0026-00000021", // COPY_BETWEEN_DIR_AND_FILE
    "0026-00000022", // PATH_LOCK_CONFLICT
    "0026-00000025", // RENAME_TO_AN_EXISTED_DIR
    "0026-00000026", // RENAME_TO_SUB_DIR
    "0026-00000027", // RENAME_BETWEEN_DIR_AND_FILE
    "0017-00000208", // APPEND_OFFSET_NOT_MATCHED
    "0017-00000209", // APPEND_NOT_APPENDABLE
];

/// Retry configuration / 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retry_num")]
    pub max_retry_num: u32,
    #[serde(default = "default_sleep_base", with = "millis")]
    pub sleep_base: Duration,
    #[serde(default = "default_sleep_max", with = "millis")]
    pub sleep_max: Duration,
}

fn default_max_retry_num() -> u32 {
    MAX_RETRY_NUM
}

fn default_sleep_base() -> Duration {
    Duration::from_millis(SLEEP_BASE_MILLIS)
}

fn default_sleep_max() -> Duration {
    Duration::from_secs(SLEEP_MAX_SECONDS)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_num: default_max_retry_num(),
            sleep_base: default_sleep_base(),
            sleep_max: default_sleep_max(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl RetryPolicy {
    /// Policy that never retries / 不重试的策略
    pub fn no_retry() -> Self {
        Self {
            max_retry_num: 1,
            ..Self::default()
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error or
    /// the attempts are exhausted / 执行操作并按需重试
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retry_num = self.max_retry_num.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_retryable_error(&e) {
                        return Err(e);
                    }
                    if attempt >= max_retry_num {
                        tracing::error!(
                            "Retry exhausted after {} times: {} - {}",
                            max_retry_num,
                            operation_name,
                            e
                        );
                        return Err(e);
                    }
                    let sleep_time = self.sleep_time(&e, attempt);
                    tracing::warn!(
                        "Retry TOS request {} in the {} times after {:?}, error: {}",
                        operation_name,
                        attempt,
                        sleep_time,
                        e
                    );
                    tokio::time::sleep(sleep_time).await;
                }
            }
        }
    }

    /// Backoff before the next attempt / 计算下次重试前的等待时间
    pub fn sleep_time(&self, err: &TosfsError, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let sleep_time = self
            .sleep_base
            .checked_mul(factor)
            .unwrap_or(self.sleep_max)
            .min(self.sleep_max);

        match err {
            TosfsError::Server {
                status: TOO_MANY_REQUESTS_CODE | SERVICE_UNAVAILABLE_CODE,
                retry_after: Some(secs),
                ..
            } => sleep_time.max(Duration::from_secs(*secs)),
            _ => sleep_time,
        }
    }
}

/// Whether an error is worth retrying / 判断错误是否可重试
pub fn is_retryable_error(err: &TosfsError) -> bool {
    is_retryable_server_error(err) || is_retryable_client_error(err)
}

fn is_retryable_server_error(err: &TosfsError) -> bool {
    let TosfsError::Server { status, ec, code, .. } = err else {
        return false;
    };
    // not all conflict errors are retryable
    if *status == CONFLICT_CODE {
        return !NOT_RETRYABLE_CONFLICT_ERROR_CODES.contains(&ec.as_str())
            && !NOT_RETRYABLE_CONFLICT_ERROR_CODES.contains(&code.as_str());
    }
    RETRYABLE_SERVER_STATUS_CODES.contains(status)
}

fn is_retryable_client_error(err: &TosfsError) -> bool {
    match err {
        TosfsError::Client { kind, .. } => !matches!(kind, ClientErrorKind::Other),
        TosfsError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict(ec: &str) -> TosfsError {
        TosfsError::Server {
            status: 409,
            code: "Conflict".into(),
            ec: ec.into(),
            message: "conflict".into(),
            request_id: "test-id".into(),
            retry_after: None,
        }
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = TosfsError::Server {
            status: 429,
            code: "ExceedAccountExternalRateLimit".into(),
            ec: "0004-00000001".into(),
            message: "Exceed account external rate limit. Too much throughput in a short period of time, please slow down.".into(),
            request_id: "KmsJSKDKhjasdlKmsduwRETYHB".into(),
            retry_after: None,
        };
        assert!(is_retryable_error(&err));
    }

    #[test]
    fn test_connection_reset_is_retryable() {
        let err = TosfsError::client(
            ClientErrorKind::Connection,
            "http request timeout: ('Connection aborted.', ConnectionResetError(104, 'Connection reset by peer'))",
        );
        assert!(is_retryable_error(&err));

        let err = TosfsError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert!(is_retryable_error(&err));
    }

    #[test]
    fn test_conflict_codes() {
        assert!(is_retryable_error(&conflict("")));
        assert!(!is_retryable_error(&conflict("0026-00000013")));
        assert!(!is_retryable_error(&conflict("0017-00000209")));
    }

    #[test]
    fn test_not_retryable() {
        assert!(!is_retryable_error(&TosfsError::server(404, "NoSuchKey", "missing")));
        assert!(!is_retryable_error(&TosfsError::server(403, "AccessDenied", "denied")));
        assert!(!is_retryable_error(&TosfsError::NotFound("a".into())));
        assert!(!is_retryable_error(&TosfsError::client(ClientErrorKind::Other, "bad url")));
    }

    #[test]
    fn test_sleep_time() {
        let policy = RetryPolicy::default();
        let err = TosfsError::server(500, "InternalError", "boom");
        assert_eq!(policy.sleep_time(&err, 1), Duration::from_millis(200));
        assert_eq!(policy.sleep_time(&err, 3), Duration::from_millis(800));
        assert_eq!(policy.sleep_time(&err, 20), Duration::from_secs(60));

        let throttled = TosfsError::Server {
            status: 503,
            code: "ServiceUnavailable".into(),
            ec: String::new(),
            message: "slow down".into(),
            request_id: String::new(),
            retry_after: Some(5),
        };
        assert_eq!(policy.sleep_time(&throttled, 1), Duration::from_secs(5));
        assert_eq!(policy.sleep_time(&throttled, 10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy {
            max_retry_num: 5,
            sleep_base: Duration::from_millis(1),
            sleep_max: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let out = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TosfsError::server(503, "ServiceUnavailable", "busy"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal_and_exhaustion() {
        let policy = RetryPolicy {
            max_retry_num: 3,
            sleep_base: Duration::from_millis(1),
            sleep_max: Duration::from_millis(2),
        };

        let calls = AtomicU32::new(0);
        let res: Result<()> = policy
            .run("fatal", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict("0026-00000013"))
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let res: Result<()> = policy
            .run("busy", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TosfsError::server(500, "InternalError", "boom"))
            })
            .await;
        assert!(matches!(res, Err(TosfsError::Server { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
