//! 请求参数归一化：在边界处把松散的 JSON 一次性解析成带类型的 [`GenerationRequest`]。
//!
//! 模式判定顺序：多视角 → 单图 → 文本；都没有时只有携带 `mesh` 才合法。
//! 默认值按模式区分，单图偏速度，多视角偏质量，数值需保持不变。

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::GenerationError;
use crate::mesh::ExportFormat;
use crate::types::{GenerateBody, MultiviewImagesBody};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDefaults {
    pub seed: u64,
    pub octree_resolution: u32,
    pub num_inference_steps: u32,
    pub num_chunks: u32,
    pub guidance_scale: f32,
    pub flash_vdm: bool,
}

/// 单图与文本模式
pub const SINGLE_VIEW_DEFAULTS: SamplingDefaults = SamplingDefaults {
    seed: 1234,
    octree_resolution: 128,
    num_inference_steps: 5,
    num_chunks: 8000,
    guidance_scale: 5.0,
    flash_vdm: true,
};

pub const MULTIVIEW_DEFAULTS: SamplingDefaults = SamplingDefaults {
    seed: 1234,
    octree_resolution: 380,
    num_inference_steps: 50,
    num_chunks: 20000,
    guidance_scale: 5.0,
    flash_vdm: false,
};

pub const DEFAULT_FACE_COUNT: usize = 40000;

/// 启动时加载了哪些可选管线
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub texture: bool,
    pub multiview: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationMode {
    SingleImage { image: Vec<u8> },
    TextPrompt { text: String },
    Multiview { front: Vec<u8>, left: Vec<u8>, back: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeTag {
    SingleImage,
    TextPrompt,
    Multiview,
    SuppliedMesh,
}

impl std::fmt::Display for ModeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModeTag::SingleImage => "single_image",
            ModeTag::TextPrompt => "text_prompt",
            ModeTag::Multiview => "multiview",
            ModeTag::SuppliedMesh => "supplied_mesh",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub seed: u64,
    pub octree_resolution: u32,
    pub num_inference_steps: u32,
    pub num_chunks: u32,
    pub guidance_scale: f32,
    /// 单图管线用 FlashVDM 的 marching cubes 解码
    pub flash_vdm: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeSource {
    Sample(SamplingParams),
    /// 调用方提供的 GLB，原样使用
    Supplied(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessing {
    pub texture: bool,
    pub face_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub mode: Option<GenerationMode>,
    pub shape: ShapeSource,
    pub post: PostProcessing,
    pub format: ExportFormat,
}

impl GenerationRequest {
    pub fn mode_tag(&self) -> ModeTag {
        match &self.mode {
            Some(GenerationMode::Multiview { .. }) => ModeTag::Multiview,
            Some(GenerationMode::SingleImage { .. }) => ModeTag::SingleImage,
            Some(GenerationMode::TextPrompt { .. }) => ModeTag::TextPrompt,
            None => ModeTag::SuppliedMesh,
        }
    }
}

pub fn normalize(
    body: GenerateBody,
    capabilities: &Capabilities,
) -> Result<GenerationRequest, GenerationError> {
    let format = match body.format.as_deref() {
        Some(s) => s
            .parse::<ExportFormat>()
            .map_err(|e| GenerationError::invalid(e.to_string()))?,
        None => ExportFormat::default(),
    };

    let mode = if body.multiview {
        let images = body
            .images
            .as_ref()
            .ok_or_else(|| GenerationError::invalid("no images provided for multiview generation"))?;
        let mode = multiview_mode(images)?;
        if !capabilities.multiview {
            return Err(GenerationError::configuration(
                "multiview pipeline not loaded, start the server with --enable_multiview",
            ));
        }
        Some(mode)
    } else if let Some(image) = &body.image {
        Some(GenerationMode::SingleImage {
            image: decode_image("image", image)?,
        })
    } else if let Some(text) = &body.text {
        if text.trim().is_empty() {
            return Err(GenerationError::invalid("text prompt is empty"));
        }
        Some(GenerationMode::TextPrompt { text: text.clone() })
    } else {
        None
    };

    if mode.is_none() && body.mesh.is_none() {
        return Err(GenerationError::invalid("no input image, text or mesh provided"));
    }

    if body.texture {
        if !capabilities.texture {
            return Err(GenerationError::configuration(
                "texture pipeline not loaded, start the server with --enable_tex",
            ));
        }
        if mode.is_none() {
            return Err(GenerationError::invalid(
                "texturing a supplied mesh needs an image or text prompt",
            ));
        }
    }

    let face_count = body.face_count.unwrap_or(DEFAULT_FACE_COUNT);
    if face_count == 0 {
        return Err(GenerationError::invalid("face_count must be positive"));
    }

    let shape = match &body.mesh {
        Some(mesh) => ShapeSource::Supplied(
            STANDARD
                .decode(mesh)
                .map_err(|e| GenerationError::invalid(format!("mesh is not valid base64: {e}")))?,
        ),
        None => {
            let defaults = match mode {
                Some(GenerationMode::Multiview { .. }) => MULTIVIEW_DEFAULTS,
                _ => SINGLE_VIEW_DEFAULTS,
            };
            ShapeSource::Sample(sampling_params(&body, &defaults)?)
        }
    };

    Ok(GenerationRequest {
        mode,
        shape,
        post: PostProcessing {
            texture: body.texture,
            face_count,
        },
        format,
    })
}

fn multiview_mode(images: &MultiviewImagesBody) -> Result<GenerationMode, GenerationError> {
    let view = |name: &str, value: &Option<String>| match value {
        Some(encoded) => decode_image(name, encoded),
        None => Err(GenerationError::invalid(format!(
            "missing {name} image for multiview generation"
        ))),
    };
    Ok(GenerationMode::Multiview {
        front: view("front", &images.front)?,
        left: view("left", &images.left)?,
        back: view("back", &images.back)?,
    })
}

fn decode_image(field: &str, encoded: &str) -> Result<Vec<u8>, GenerationError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GenerationError::invalid(format!("{field} is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(GenerationError::invalid(format!("{field} is empty")));
    }
    Ok(bytes)
}

fn sampling_params(
    body: &GenerateBody,
    defaults: &SamplingDefaults,
) -> Result<SamplingParams, GenerationError> {
    let params = SamplingParams {
        seed: body.seed.unwrap_or(defaults.seed),
        octree_resolution: body.octree_resolution.unwrap_or(defaults.octree_resolution),
        num_inference_steps: body.num_inference_steps.unwrap_or(defaults.num_inference_steps),
        num_chunks: body.num_chunks.unwrap_or(defaults.num_chunks),
        guidance_scale: body.guidance_scale.unwrap_or(defaults.guidance_scale),
        flash_vdm: defaults.flash_vdm,
    };

    for (name, value) in [
        ("octree_resolution", params.octree_resolution),
        ("num_inference_steps", params.num_inference_steps),
        ("num_chunks", params.num_chunks),
    ] {
        if value == 0 {
            return Err(GenerationError::invalid(format!("{name} must be positive")));
        }
    }
    if !params.guidance_scale.is_finite() {
        return Err(GenerationError::invalid("guidance_scale must be finite"));
    }
    Ok(params)
}
