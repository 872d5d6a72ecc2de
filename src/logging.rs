//! 日志初始化。
//!
//! - 按天滚动写入 `{cache_dir}/controller.log`
//! - 同时输出到 stdout
//! - `RUST_LOG` 优先，未设置时使用配置里的默认过滤规则

use std::fs;
use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// 进程存活期间必须持有；drop 时刷新并关闭日志文件
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(&config.directory)?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter(&config.default_filter))
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 全局 subscriber 只能装一次，整个测试二进制里只有下面一个用例去装

    #[test]
    fn bad_default_filter_falls_back_to_info() {
        let filter = env_filter("this is [not a filter");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn second_init_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: tmp.path().join("a").join("b"),
            ..LoggingConfig::default()
        };
        let _guard = init_logging(&config).unwrap();
        assert!(config.directory.is_dir());

        let err = init_logging(&config).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
