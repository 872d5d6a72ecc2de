//! 服务配置：由 [`ServerArgs`] 校验后得到，启动后只读。

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::artifacts::RetentionPolicy;
use crate::cli::ServerArgs;
use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: IpAddr,
    pub port: u16,
    /// JSON、表单、单个文件共用的上限
    pub max_upload_bytes: u64,
    pub static_dir: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8081,
            max_upload_bytes: 64 * MIB,
            static_dir: PathBuf::from("static"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub model_path: String,
    pub subfolder: String,
    pub tex_model_path: String,
    pub mv_model_path: String,
    pub mv_subfolder: String,
    pub device: String,
    pub enable_tex: bool,
    pub enable_multiview: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: "tencent/Hunyuan3D-2mini".to_string(),
            subfolder: "hunyuan3d-dit-v2-mini-turbo".to_string(),
            tex_model_path: "tencent/Hunyuan3D-2".to_string(),
            mv_model_path: "tencent/Hunyuan3D-2mv".to_string(),
            mv_subfolder: "hunyuan3d-dit-v2-mv".to_string(),
            device: "cpu".to_string(),
            enable_tex: false,
            enable_multiview: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
    pub retention: RetentionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("gradio_cache"),
            retention: RetentionPolicy {
                max_age: Duration::from_secs(24 * 3600),
                interval: Duration::from_secs(600),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_name: String,
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("gradio_cache"),
            file_name: "controller.log".to_string(),
            default_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub worker_id: String,
    pub limit_model_concurrency: usize,
    pub http: HttpConfig,
    pub models: ModelConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_id: new_worker_id(),
            limit_model_concurrency: 5,
            http: HttpConfig::default(),
            models: ModelConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        if args.limit_model_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        let host: IpAddr = args.host.parse().map_err(|_| ConfigError::InvalidValue {
            field: "host",
            reason: format!("`{}` is not an IP address", args.host),
        })?;
        if args.max_upload_mib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_upload_mib",
                reason: "must be at least 1".to_string(),
            });
        }
        if args.retention_hours > 0 && args.retention_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retention_interval_secs",
                reason: "must be at least 1 when retention is enabled".to_string(),
            });
        }
        let worker_id = match args.worker_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => new_worker_id(),
        };

        Ok(Self {
            worker_id,
            limit_model_concurrency: args.limit_model_concurrency,
            http: HttpConfig {
                host,
                port: args.port,
                max_upload_bytes: args.max_upload_mib.saturating_mul(MIB),
                static_dir: args.static_dir,
            },
            models: ModelConfig {
                model_path: args.model_path,
                subfolder: args.subfolder,
                tex_model_path: args.tex_model_path,
                mv_model_path: args.mv_model_path,
                mv_subfolder: args.mv_subfolder,
                device: args.device,
                enable_tex: args.enable_tex,
                enable_multiview: args.enable_multiview,
            },
            storage: StorageConfig {
                cache_dir: args.save_dir.clone(),
                retention: RetentionPolicy {
                    max_age: Duration::from_secs(args.retention_hours.saturating_mul(3600)),
                    interval: Duration::from_secs(args.retention_interval_secs),
                },
            },
            logging: LoggingConfig {
                directory: args.save_dir,
                file_name: "controller.log".to_string(),
                default_filter: args.log_filter,
            },
        })
    }
}

// uuid 前 6 位十六进制
fn new_worker_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> ServerArgs {
        let mut argv = vec!["meshgen-server"];
        argv.extend_from_slice(extra);
        ServerArgs::parse_from(argv)
    }

    #[test]
    fn builds_from_explicit_args() {
        let config = ServerConfig::from_args(args(&[
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--save_dir",
            "/tmp/meshes",
            "--max-upload-mib",
            "8",
            "--worker-id",
            "w-test",
            "--retention-hours",
            "2",
        ]))
        .unwrap();
        assert_eq!(config.http.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.http.max_upload_bytes, 8 * MIB);
        assert_eq!(config.worker_id, "w-test");
        assert_eq!(config.storage.cache_dir, PathBuf::from("/tmp/meshes"));
        assert_eq!(config.logging.directory, PathBuf::from("/tmp/meshes"));
        assert_eq!(config.logging.file_name, "controller.log");
        assert_eq!(config.storage.retention.max_age, Duration::from_secs(7200));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = ServerConfig::from_args(args(&["--limit-model-concurrency", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }

    #[test]
    fn hostname_must_be_an_ip() {
        let err = ServerConfig::from_args(args(&["--host", "not an address"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "host", .. }));
    }

    #[test]
    fn zero_retention_disables_sweeping() {
        let config = ServerConfig::from_args(args(&[
            "--host",
            "0.0.0.0",
            "--retention-hours",
            "0",
            "--retention-interval-secs",
            "0",
        ]))
        .unwrap();
        assert!(!config.storage.retention.enabled());
    }

    #[test]
    fn generated_worker_id_is_short_hex() {
        let config = ServerConfig::from_args(args(&["--host", "0.0.0.0"])).unwrap();
        assert_eq!(config.worker_id.len(), 6);
        assert!(config.worker_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
