//! Error types / 错误类型
//!
//! Every filesystem operation returns [`TosfsError`]. Object-store failures keep
//! the server status, the TOS error code and the request id so that the retry
//! layer can classify them.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TosfsError>;

/// Client-side failure category / 客户端错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    Timeout,
    Connection,
    Interrupted,
    Transport,
    Other,
}

#[derive(Debug, Error)]
pub enum TosfsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Missing or rejected credentials / 凭证缺失或无效
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Error response returned by the object store / 对象存储返回的错误
    #[error("TOS server error: status={status}, code={code}, ec={ec}, message={message}, request_id={request_id}")]
    Server {
        status: u16,
        code: String,
        ec: String,
        message: String,
        request_id: String,
        retry_after: Option<u64>,
    },

    /// Request never produced a server response / 请求未得到服务端响应
    #[error("TOS client error ({kind:?}): {message}")]
    Client { kind: ClientErrorKind, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{message}")]
    Tosfs { message: String },
}

impl TosfsError {
    pub fn server(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        TosfsError::Server {
            status,
            code: code.into(),
            ec: String::new(),
            message: message.into(),
            request_id: String::new(),
            retry_after: None,
        }
    }

    pub fn client(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        TosfsError::Client {
            kind,
            message: message.into(),
        }
    }

    pub fn tosfs(message: impl Into<String>) -> Self {
        TosfsError::Tosfs {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            TosfsError::NotFound(_) => true,
            TosfsError::Server { status, code, .. } => *status == 404 && code != "NoSuchBucket",
            _ => false,
        }
    }

    /// HTTP status of a server error / 服务端错误的HTTP状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            TosfsError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<TosfsError> for io::Error {
    fn from(err: TosfsError) -> Self {
        let kind = match &err {
            TosfsError::NotFound(_) => io::ErrorKind::NotFound,
            TosfsError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            TosfsError::InvalidPath(_) | TosfsError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            TosfsError::Unsupported(_) => io::ErrorKind::Unsupported,
            TosfsError::Credentials(_) => io::ErrorKind::PermissionDenied,
            TosfsError::Client {
                kind: ClientErrorKind::Timeout,
                ..
            } => io::ErrorKind::TimedOut,
            TosfsError::Client {
                kind: ClientErrorKind::Interrupted,
                ..
            } => io::ErrorKind::Interrupted,
            TosfsError::Server { status: 404, .. } => io::ErrorKind::NotFound,
            TosfsError::Server { status: 403, .. } => io::ErrorKind::PermissionDenied,
            TosfsError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        match err {
            TosfsError::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}
