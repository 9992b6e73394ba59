//! Logging setup / 日志初始化

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Translate a `TOSFS_LOGGING_LEVEL` value into a filter directive / 日志级别转换为过滤指令
///
/// Python-style level names are accepted, anything containing `=` or `,`
/// is used as a raw `tracing` filter.
pub fn level_directive(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let level = match level.to_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "" | "INFO" => "info",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        "OFF" => "off",
        other => {
            eprintln!("unknown logging level {}, using INFO", other);
            "info"
        }
    };
    format!("tosfs={}", level)
}

/// Install the global subscriber, later calls are no-ops / 安装全局日志订阅器
pub fn init(level: &str) {
    let directive = level_directive(level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("tosfs=info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok();
    if installed {
        tracing::warn!("The tosfs's log level is set to be {}", directive);
    }
}
