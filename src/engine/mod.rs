//! 模型管线抽象。
//!
//! 真正的扩散采样、网格解码、纹理绘制都在外部管线里，这里只定义接口，
//! 外加一组确定性的内置实现，让服务在没有 GPU 权重时也能端到端跑通。

pub mod hull;
pub mod rembg;
pub mod text2image;
pub mod texture;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::RgbaImage;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::GenerationError;
use crate::mesh::Mesh;
use crate::normalizer::{Capabilities, SamplingParams};

pub use hull::SilhouetteHullPipeline;
pub use rembg::BorderKeyRemover;
pub use text2image::SeededTextToImage;
pub use texture::ProjectionPainter;

/// 去背景后的条件图片
#[derive(Debug, Clone)]
pub enum Conditioning {
    Single(RgbaImage),
    Multiview {
        front: RgbaImage,
        left: RgbaImage,
        back: RgbaImage,
    },
}

impl Conditioning {
    /// 纹理绘制用的参考图：多视角时取正面
    pub fn texture_reference(&self) -> &RgbaImage {
        match self {
            Conditioning::Single(image) => image,
            Conditioning::Multiview { front, .. } => front,
        }
    }
}

/// 图片（或多视角图片）→ 网格
#[async_trait]
pub trait ShapePipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        conditioning: &Conditioning,
        params: &SamplingParams,
    ) -> Result<Mesh, GenerationError>;
}

#[async_trait]
pub trait TextToImage: Send + Sync {
    async fn render(&self, prompt: &str) -> Result<RgbaImage, GenerationError>;
}

pub trait BackgroundRemover: Send + Sync {
    fn remove(&self, image: RgbaImage) -> Result<RgbaImage, GenerationError>;
}

#[async_trait]
pub trait TexturePainter: Send + Sync {
    async fn paint(&self, mesh: Mesh, reference: &RgbaImage) -> Result<Mesh, GenerationError>;
}

/// 每个任务结束后释放设备缓存
pub trait DeviceMemory: Send + Sync {
    fn empty_cache(&self);
}

/// 宿主机上的“设备”：没有显存可释放，只记录次数
#[derive(Debug, Default)]
pub struct HostDevice {
    name: String,
    releases: AtomicUsize,
}

impl HostDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceMemory for HostDevice {
    fn empty_cache(&self) {
        let n = self.releases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(device = %self.name, releases = n, "device cache released");
    }
}

/// 一个 worker 持有的全部管线
#[derive(Clone)]
pub struct ModelSet {
    pub shape: Arc<dyn ShapePipeline>,
    pub shape_multiview: Option<Arc<dyn ShapePipeline>>,
    pub text_to_image: Arc<dyn TextToImage>,
    pub background: Arc<dyn BackgroundRemover>,
    pub texture: Option<Arc<dyn TexturePainter>>,
    pub device: Arc<dyn DeviceMemory>,
}

impl ModelSet {
    /// 按配置装配内置管线；可选管线只在对应开关打开时加载
    pub fn load(config: &ModelConfig, worker_id: &str) -> Self {
        info!(
            model = %config.model_path,
            subfolder = %config.subfolder,
            device = %config.device,
            worker_id,
            "Loading the shape model"
        );
        let shape: Arc<dyn ShapePipeline> = Arc::new(SilhouetteHullPipeline::new(&format!(
            "{}/{}",
            config.model_path, config.subfolder
        )));

        let shape_multiview: Option<Arc<dyn ShapePipeline>> = if config.enable_multiview {
            info!(model = %config.mv_model_path, subfolder = %config.mv_subfolder, "Loading multiview model");
            Some(Arc::new(SilhouetteHullPipeline::new(&format!(
                "{}/{}",
                config.mv_model_path, config.mv_subfolder
            ))))
        } else {
            None
        };

        let texture: Option<Arc<dyn TexturePainter>> = if config.enable_tex {
            info!(model = %config.tex_model_path, "Loading texture model");
            Some(Arc::new(ProjectionPainter::default()))
        } else {
            None
        };

        Self {
            shape,
            shape_multiview,
            text_to_image: Arc::new(SeededTextToImage::default()),
            background: Arc::new(BorderKeyRemover::default()),
            texture,
            device: HostDevice::new(&config.device),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            texture: self.texture.is_some(),
            multiview: self.shape_multiview.is_some(),
        }
    }
}
