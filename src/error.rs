use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 生成任务的错误分类。
/// HTTP 同步接口对外统一成同一个错误信封，但内部保留种类，便于日志和 `/status` 区分。
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Configuration,
    Device,
    Unclassified,
}

impl GenerationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Device(_) => ErrorKind::Device,
            Self::Unclassified(_) => ErrorKind::Unclassified,
        }
    }
}

impl From<std::io::Error> for GenerationError {
    fn from(e: std::io::Error) -> Self {
        Self::Unclassified(e.into())
    }
}

// spawn_blocking / spawn 里的 panic 或取消
impl From<tokio::task::JoinError> for GenerationError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unclassified(anyhow::anyhow!("worker task failed: {e}"))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Device => write!(f, "device"),
            ErrorKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// 启动阶段的配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("limit-model-concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_variant() {
        assert_eq!(GenerationError::invalid("x").kind(), ErrorKind::InvalidInput);
        assert_eq!(GenerationError::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(GenerationError::device("x").kind(), ErrorKind::Device);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert_eq!(GenerationError::from(io).kind(), ErrorKind::Unclassified);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidInput).unwrap();
        assert_eq!(json, "\"invalid_input\"");
        assert_eq!(ErrorKind::Device.to_string(), "device");
    }
}
