//! 命令行参数。
//!
//! 参数名沿用旧部署脚本里的写法（`--model_path`、`--enable_tex` 等），
//! 同时接受连字符形式；大部分参数可以由环境变量提供。

use std::path::PathBuf;

use clap::Parser;

/// 3D 网格生成推理服务
#[derive(Debug, Clone, Parser)]
#[command(name = "meshgen-server", version, about)]
pub struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "HOST_PORT", default_value_t = 8081)]
    pub port: u16,

    /// 形状模型
    #[arg(
        long = "model_path",
        alias = "model-path",
        env = "MODEL_PATH",
        default_value = "tencent/Hunyuan3D-2mini"
    )]
    pub model_path: String,

    #[arg(
        long = "subfolder",
        env = "MODEL_SUBFOLDER",
        default_value = "hunyuan3d-dit-v2-mini-turbo"
    )]
    pub subfolder: String,

    /// 纹理模型，只在 `--enable_tex` 时加载
    #[arg(
        long = "tex_model_path",
        alias = "tex-model-path",
        env = "TEX_MODEL_PATH",
        default_value = "tencent/Hunyuan3D-2"
    )]
    pub tex_model_path: String,

    /// 多视角形状模型，只在 `--enable_multiview` 时加载
    #[arg(
        long = "mv_model_path",
        alias = "mv-model-path",
        env = "MV_MODEL_PATH",
        default_value = "tencent/Hunyuan3D-2mv"
    )]
    pub mv_model_path: String,

    #[arg(
        long = "mv_subfolder",
        alias = "mv-subfolder",
        env = "MV_MODEL_SUBFOLDER",
        default_value = "hunyuan3d-dit-v2-mv"
    )]
    pub mv_subfolder: String,

    #[arg(long, env = "DEVICE", default_value = "cpu")]
    pub device: String,

    /// 同时执行的生成任务上限
    #[arg(
        long = "limit-model-concurrency",
        alias = "limit_model_concurrency",
        env = "LIMIT_MODEL_CONCURRENCY",
        default_value_t = 5
    )]
    pub limit_model_concurrency: usize,

    #[arg(long = "enable_tex", alias = "enable-tex")]
    pub enable_tex: bool,

    #[arg(long = "enable_multiview", alias = "enable-multiview")]
    pub enable_multiview: bool,

    /// 结果文件和日志目录
    #[arg(
        long = "save_dir",
        alias = "save-dir",
        env = "SAVE_DIR",
        default_value = "gradio_cache"
    )]
    pub save_dir: PathBuf,

    #[arg(long = "static_dir", alias = "static-dir", env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// 请求体上限（MiB），作用于 JSON 和表单上传
    #[arg(long, env = "MAX_UPLOAD_MIB", default_value_t = 64)]
    pub max_upload_mib: u64,

    /// 结果保留时长，0 表示不清理
    #[arg(long, env = "RETENTION_HOURS", default_value_t = 24)]
    pub retention_hours: u64,

    #[arg(long, env = "RETENTION_INTERVAL_SECS", default_value_t = 600)]
    pub retention_interval_secs: u64,

    /// 不指定时随机生成
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// `RUST_LOG` 未设置时使用的过滤规则
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}
