use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::gate::GateStatus;
use crate::job_registry::JobCounts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// `/generate` 与 `/send` 的 JSON 请求体，字段按生成模式可选
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateBody {
    /// base64 编码的单张图片
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// 多视角图片，需配合 `multiview: true`
    #[serde(default)]
    pub images: Option<MultiviewImagesBody>,
    #[serde(default)]
    pub multiview: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub octree_resolution: Option<u32>,
    #[serde(default)]
    pub num_inference_steps: Option<u32>,
    #[serde(default)]
    pub num_chunks: Option<u32>,
    #[serde(default)]
    pub guidance_scale: Option<f32>,
    #[serde(default)]
    pub texture: bool,
    #[serde(default)]
    pub face_count: Option<usize>,
    /// base64 编码的 GLB；存在时跳过形状生成
    #[serde(default)]
    pub mesh: Option<String>,
    #[serde(default, rename = "type")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiviewImagesBody {
    #[serde(default)]
    pub front: Option<String>,
    #[serde(default)]
    pub left: Option<String>,
    #[serde(default)]
    pub back: Option<String>,
}

/// 所有同步接口失败时返回的统一错误信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub text: String,
    pub error_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub uid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Processing,
    Completed {
        model_base64: String,
    },
    Failed {
        error_kind: ErrorKind,
        text: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusResponse {
    pub worker_id: String,
    pub speed: u32,
    pub queue_length: usize,
    pub gate: GateStatus,
    pub jobs: JobCounts,
}
