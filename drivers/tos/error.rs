//! TOS error responses / TOS错误响应解析

use chrono::{DateTime, Utc};
use s3::error::S3Error;
use serde::Deserialize;

use crate::error::{ClientErrorKind, TosfsError};

/// Error body, XML for the S3 API and JSON for the native one / 错误响应体
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "RequestId", default)]
    request_id: String,
    #[serde(rename = "EC", default)]
    ec: String,
}

fn parse_error_body(body: &str) -> ErrorBody {
    let body = body.trim();
    if body.is_empty() {
        return ErrorBody::default();
    }
    if body.starts_with('{') {
        return serde_json::from_str(body).unwrap_or_default();
    }
    quick_xml::de::from_str(body).unwrap_or_else(|_| ErrorBody {
        message: body.to_string(),
        ..ErrorBody::default()
    })
}

fn default_code(status: u16) -> &'static str {
    match status {
        400 => "BadRequest",
        403 => "AccessDenied",
        404 => "NoSuchKey",
        409 => "Conflict",
        429 => "TooManyRequests",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        _ => "Unknown",
    }
}

/// Server error from an HTTP status and body / 由状态码和响应体构造服务端错误
pub fn server_error(status: u16, body: &str) -> TosfsError {
    let parsed = parse_error_body(body);
    let code = if parsed.code.is_empty() {
        default_code(status).to_string()
    } else {
        parsed.code
    };
    TosfsError::Server {
        status,
        code,
        ec: parsed.ec,
        message: parsed.message,
        request_id: parsed.request_id,
        retry_after: None,
    }
}

/// Classify a transport failure by its message / 按错误信息分类客户端错误
pub fn classify_client_error(message: &str) -> ClientErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ClientErrorKind::Timeout
    } else if lower.contains("interrupted") {
        ClientErrorKind::Interrupted
    } else if ["connection", "connect", "reset", "refused", "broken pipe", "dns"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ClientErrorKind::Connection
    } else if ["error sending request", "hyper", "reqwest", "incomplete", "unexpected eof"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ClientErrorKind::Transport
    } else {
        ClientErrorKind::Other
    }
}

/// Map an SDK error / 转换SDK错误
pub fn map_s3_error(err: S3Error) -> TosfsError {
    match err {
        S3Error::HttpFailWithBody(status, body) => server_error(status, &body),
        other => {
            let message = other.to_string();
            if message.contains("NoSuchBucket") {
                return TosfsError::server(404, "NoSuchBucket", message);
            }
            if message.to_lowercase().contains("credentials") {
                return TosfsError::Credentials(message);
            }
            TosfsError::client(classify_client_error(&message), message)
        }
    }
}

/// Whether an SDK error is a plain 404 / 是否为404
pub fn is_missing(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

/// Parse RFC 3339 (listings) or RFC 2822 (headers) timestamps / 解析时间戳
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_from_xml() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>NoSuchBucket</Code>
  <Message>The specified bucket does not exist.</Message>
  <RequestId>4e1a2b3c</RequestId>
  <EC>0006-00000001</EC>
</Error>"#;
        match server_error(404, body) {
            TosfsError::Server {
                status,
                code,
                ec,
                request_id,
                ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(code, "NoSuchBucket");
                assert_eq!(ec, "0006-00000001");
                assert_eq!(request_id, "4e1a2b3c");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!server_error(404, body).is_not_found());
    }

    #[test]
    fn test_server_error_from_json_and_empty_body() {
        let err = server_error(409, r#"{"Code":"PathLockConflict","Message":"busy","EC":"0026-00000022"}"#);
        assert!(matches!(err, TosfsError::Server { ref ec, .. } if ec == "0026-00000022"));

        let err = server_error(404, "");
        assert!(err.is_not_found());
        assert!(matches!(err, TosfsError::Server { ref code, .. } if code == "NoSuchKey"));
    }

    #[test]
    fn test_classify_client_error() {
        assert_eq!(classify_client_error("operation timed out"), ClientErrorKind::Timeout);
        assert_eq!(classify_client_error("Connection reset by peer"), ClientErrorKind::Connection);
        assert_eq!(
            classify_client_error("error sending request for url (https://x)"),
            ClientErrorKind::Transport
        );
        assert_eq!(classify_client_error("invalid xml"), ClientErrorKind::Other);
    }

    #[test]
    fn test_parse_timestamp() {
        let listed = parse_timestamp("2024-05-01T08:30:00.000Z").unwrap();
        let header = parse_timestamp("Wed, 01 May 2024 08:30:00 GMT").unwrap();
        assert_eq!(listed, header);
        assert!(parse_timestamp("yesterday").is_none());
    }
}
