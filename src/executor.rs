//! 单个生成任务的执行流程。
//!
//! 拿到闸门许可后依次执行：条件图准备 → 形状 → （可选）后处理与上色 → 导出 → 落盘。
//! 许可和设备缓存都由 RAII 守卫释放，任何退出路径都不会泄漏。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::engine::{BackgroundRemover, Conditioning, DeviceMemory, ModelSet};
use crate::error::GenerationError;
use crate::gate::ConcurrencyGate;
use crate::job_registry::JobRegistry;
use crate::mesh::postprocess::{run_stages, standard_stages, MeshStage};
use crate::mesh::{glb, ExportFormat, Mesh};
use crate::normalizer::{GenerationMode, GenerationRequest, ShapeSource};

/// 按目标面数构造后处理步骤
pub type StageFactory = Arc<dyn Fn(usize) -> Vec<Box<dyn MeshStage>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub uid: Uuid,
    pub path: PathBuf,
    pub format: ExportFormat,
}

pub struct JobExecutor {
    models: ModelSet,
    gate: Arc<ConcurrencyGate>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<JobRegistry>,
    stages: StageFactory,
}

/// drop 时清空设备缓存；声明在许可之后，先于许可释放
struct DeviceCacheGuard<'a>(&'a dyn DeviceMemory);

impl Drop for DeviceCacheGuard<'_> {
    fn drop(&mut self) {
        self.0.empty_cache();
    }
}

impl JobExecutor {
    pub fn new(
        models: ModelSet,
        gate: Arc<ConcurrencyGate>,
        artifacts: Arc<ArtifactStore>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            models,
            gate,
            artifacts,
            registry,
            stages: Arc::new(standard_stages),
        }
    }

    pub fn with_stages(mut self, stages: StageFactory) -> Self {
        self.stages = stages;
        self
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// 执行任务并把结果写入注册表。`uid` 应已在注册表中登记。
    pub async fn execute(
        &self,
        uid: Uuid,
        request: GenerationRequest,
    ) -> Result<Artifact, GenerationError> {
        let span = info_span!("job", %uid, mode = %request.mode_tag());
        async move {
            let start = Instant::now();
            let result = self.run(uid, request).await;
            match &result {
                Ok(artifact) => {
                    info!(
                        path = %artifact.path.display(),
                        elapsed_secs = start.elapsed().as_secs_f32(),
                        "job completed"
                    );
                    self.registry.mark_completed(&uid, artifact.path.clone());
                }
                Err(e) => {
                    warn!(kind = %e.kind(), error = %e, "job failed");
                    self.registry.mark_failed(&uid, e);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, uid: Uuid, request: GenerationRequest) -> Result<Artifact, GenerationError> {
        let _permit = self.gate.acquire().await?;
        let _device = DeviceCacheGuard(self.models.device.as_ref());
        self.registry.mark_running(&uid);

        let conditioning = match request.mode {
            Some(mode) => Some(self.condition(mode).await?),
            None => None,
        };

        let mesh = match request.shape {
            ShapeSource::Supplied(bytes) => tokio::task::spawn_blocking(move || glb::decode(&bytes))
                .await?
                .map_err(|e| GenerationError::invalid(format!("supplied mesh is not a valid GLB: {e}")))?,
            ShapeSource::Sample(params) => {
                let conditioning = conditioning
                    .as_ref()
                    .ok_or_else(|| GenerationError::invalid("shape sampling needs an image or text prompt"))?;
                let pipeline = match conditioning {
                    Conditioning::Multiview { .. } => self
                        .models
                        .shape_multiview
                        .as_ref()
                        .ok_or_else(|| GenerationError::configuration("multiview pipeline not loaded"))?,
                    Conditioning::Single(_) => &self.models.shape,
                };
                pipeline.generate(conditioning, &params).await?
            }
        };

        let mesh = if request.post.texture {
            self.texture(mesh, conditioning.as_ref(), request.post.face_count).await?
        } else {
            mesh
        };

        let format = request.format;
        let bytes = tokio::task::spawn_blocking(move || format.encode(&mesh))
            .await?
            .map_err(|e| GenerationError::Unclassified(e.into()))?;
        let path = self.artifacts.write(&uid, format, &bytes).await?;

        Ok(Artifact { uid, path, format })
    }

    async fn condition(&self, mode: GenerationMode) -> Result<Conditioning, GenerationError> {
        let background = Arc::clone(&self.models.background);
        match mode {
            GenerationMode::SingleImage { image } => {
                Ok(Conditioning::Single(prepare_image(background, image).await?))
            }
            GenerationMode::TextPrompt { text } => {
                let image = self.models.text_to_image.render(&text).await?;
                let image = tokio::task::spawn_blocking(move || background.remove(image)).await??;
                Ok(Conditioning::Single(image))
            }
            GenerationMode::Multiview { front, left, back } => Ok(Conditioning::Multiview {
                front: prepare_image(Arc::clone(&background), front).await?,
                left: prepare_image(Arc::clone(&background), left).await?,
                back: prepare_image(background, back).await?,
            }),
        }
    }

    async fn texture(
        &self,
        mesh: Mesh,
        conditioning: Option<&Conditioning>,
        face_count: usize,
    ) -> Result<Mesh, GenerationError> {
        let painter = self
            .models
            .texture
            .as_ref()
            .ok_or_else(|| GenerationError::configuration("texture pipeline not loaded"))?;
        let reference = conditioning
            .map(Conditioning::texture_reference)
            .ok_or_else(|| GenerationError::invalid("texturing needs a reference image"))?;

        let stages = (self.stages)(face_count);
        let mesh = tokio::task::spawn_blocking(move || run_stages(&stages, mesh)).await??;
        painter.paint(mesh, reference).await
    }
}

async fn prepare_image(
    background: Arc<dyn BackgroundRemover>,
    bytes: Vec<u8>,
) -> Result<RgbaImage, GenerationError> {
    tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| GenerationError::invalid(format!("cannot decode image: {e}")))?
            .to_rgba8();
        background.remove(image)
    })
    .await?
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use parking_lot::Mutex;

    use super::test_support::*;
    use super::*;
    use crate::engine::{BorderKeyRemover, HostDevice};
    use crate::error::ErrorKind;
    use crate::job_registry::JobState;
    use crate::mesh::fixtures;
    use crate::normalizer::{normalize, Capabilities, SINGLE_VIEW_DEFAULTS};
    use crate::types::GenerateBody;

    struct Harness {
        executor: Arc<JobExecutor>,
        gate: Arc<ConcurrencyGate>,
        registry: Arc<JobRegistry>,
        pipeline: Arc<InstrumentedPipeline>,
        device: Arc<HostDevice>,
        t2i: Arc<CountingTextToImage>,
        log: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
    }

    fn harness(capacity: usize, pipeline: InstrumentedPipeline) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline);
        let device = HostDevice::new("test");
        let t2i = Arc::new(CountingTextToImage::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let models = ModelSet {
            shape: pipeline.clone(),
            shape_multiview: Some(pipeline.clone()),
            text_to_image: t2i.clone(),
            background: Arc::new(BorderKeyRemover::default()),
            texture: Some(Arc::new(RecordingPainter { log: log.clone() })),
            device: device.clone(),
        };
        let gate = Arc::new(ConcurrencyGate::new(capacity));
        let registry = Arc::new(JobRegistry::new());
        let artifacts = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let executor = JobExecutor::new(models, gate.clone(), artifacts, registry.clone());
        Harness {
            executor: Arc::new(executor),
            gate,
            registry,
            pipeline,
            device,
            t2i,
            log,
            _dir: dir,
        }
    }

    fn request(body: GenerateBody) -> GenerationRequest {
        let capabilities = Capabilities {
            texture: true,
            multiview: true,
        };
        normalize(body, &capabilities).unwrap()
    }

    fn image_body() -> GenerateBody {
        GenerateBody {
            image: Some(png_base64()),
            ..GenerateBody::default()
        }
    }

    /// 记录执行顺序的后处理步骤
    struct RecordingStage {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl MeshStage for RecordingStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn apply(&self, mesh: Mesh) -> Result<Mesh, GenerationError> {
            self.log.lock().push(self.name.to_string());
            Ok(mesh)
        }
    }

    #[tokio::test]
    async fn writes_glb_and_marks_completed() {
        let h = harness(1, InstrumentedPipeline::default());
        let uid = Uuid::new_v4();
        h.registry.register(uid);

        let artifact = h.executor.execute(uid, request(image_body())).await.unwrap();
        assert_eq!(artifact.format, ExportFormat::Glb);
        assert!(artifact.path.ends_with(format!("{uid}.glb")));

        let mesh = glb::decode(&std::fs::read(&artifact.path).unwrap()).unwrap();
        assert_eq!(mesh.face_count(), 12);
        assert_eq!(h.registry.get(&uid).unwrap().state, JobState::Completed);
        assert_eq!(h.device.releases(), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let h = harness(
            2,
            InstrumentedPipeline {
                delay: Duration::from_millis(20),
                ..InstrumentedPipeline::default()
            },
        );
        let mut handles = Vec::new();
        for _ in 0..8 {
            let executor = h.executor.clone();
            let uid = Uuid::new_v4();
            h.registry.register(uid);
            let req = request(image_body());
            handles.push(tokio::spawn(async move { executor.execute(uid, req).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.pipeline.calls.load(Ordering::SeqCst), 8);
        assert!(h.pipeline.max_seen.load(Ordering::SeqCst) <= 2);
        assert!(h.gate.peak_in_use() <= 2);
        assert_eq!(h.gate.available(), 2);
        assert_eq!(h.registry.counts().completed, 8);
    }

    #[tokio::test]
    async fn failure_releases_permit_and_device_cache() {
        let h = harness(
            1,
            InstrumentedPipeline {
                fail: true,
                ..InstrumentedPipeline::default()
            },
        );
        let uid = Uuid::new_v4();
        h.registry.register(uid);

        let err = h.executor.execute(uid, request(image_body())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(h.gate.available(), 1);
        assert_eq!(h.gate.in_use(), 0);
        assert_eq!(h.device.releases(), 1);

        let job = h.registry.get(&uid).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.unwrap().kind, ErrorKind::Device);
    }

    #[tokio::test]
    async fn post_processing_runs_in_fixed_order() {
        let h = harness(1, InstrumentedPipeline::default());
        let log = h.log.clone();
        let stage_log = log.clone();
        let stages: StageFactory = Arc::new(move |_: usize| -> Vec<Box<dyn MeshStage>> {
            ["floater_removal", "degenerate_face_removal", "face_reduction"]
                .into_iter()
                .map(|name| {
                    Box::new(RecordingStage {
                        name,
                        log: stage_log.clone(),
                    }) as Box<dyn MeshStage>
                })
                .collect()
        });
        let executor = Arc::try_unwrap(h.executor).ok().unwrap().with_stages(stages);

        let mut body = image_body();
        body.texture = true;
        executor.execute(Uuid::new_v4(), request(body)).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["floater_removal", "degenerate_face_removal", "face_reduction", "texture"]
        );
    }

    #[tokio::test]
    async fn no_texture_skips_post_processing() {
        let h = harness(1, InstrumentedPipeline::default());
        h.executor.execute(Uuid::new_v4(), request(image_body())).await.unwrap();
        assert!(h.log.lock().is_empty());
    }

    #[tokio::test]
    async fn text_prompt_uses_single_view_defaults() {
        let h = harness(1, InstrumentedPipeline::default());
        let body = GenerateBody {
            text: Some("a wooden chair".to_string()),
            ..GenerateBody::default()
        };
        h.executor.execute(Uuid::new_v4(), request(body)).await.unwrap();

        assert_eq!(h.t2i.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.calls.load(Ordering::SeqCst), 1);
        let params = h.pipeline.last_params.lock().clone().unwrap();
        assert_eq!(params.octree_resolution, SINGLE_VIEW_DEFAULTS.octree_resolution);
        assert_eq!(params.num_inference_steps, SINGLE_VIEW_DEFAULTS.num_inference_steps);
    }

    #[tokio::test]
    async fn supplied_mesh_skips_shape_generation() {
        let h = harness(1, InstrumentedPipeline::default());
        let cube = glb::encode(&fixtures::cube([0.0; 3], 1.0)).unwrap();
        let body = GenerateBody {
            image: Some(png_base64()),
            mesh: Some(STANDARD.encode(cube)),
            texture: true,
            ..GenerateBody::default()
        };
        let artifact = h.executor.execute(Uuid::new_v4(), request(body)).await.unwrap();

        assert_eq!(h.pipeline.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*h.log.lock(), vec!["texture"]);
        let painted = glb::decode(&std::fs::read(artifact.path).unwrap()).unwrap();
        assert!(painted.colors.is_some());
    }

    #[tokio::test]
    async fn malformed_supplied_mesh_is_invalid_input() {
        let h = harness(1, InstrumentedPipeline::default());
        let body = GenerateBody {
            mesh: Some(STANDARD.encode(b"not a glb")),
            ..GenerateBody::default()
        };
        let err = h.executor.execute(Uuid::new_v4(), request(body)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.gate.available(), 1);
    }

    #[tokio::test]
    async fn undecodable_image_is_invalid_input() {
        let h = harness(1, InstrumentedPipeline::default());
        let body = GenerateBody {
            image: Some(STANDARD.encode(b"definitely not a png")),
            ..GenerateBody::default()
        };
        let err = h.executor.execute(Uuid::new_v4(), request(body)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.pipeline.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exports_requested_format() {
        let h = harness(1, InstrumentedPipeline::default());
        let mut body = image_body();
        body.format = Some("obj".to_string());
        let artifact = h.executor.execute(Uuid::new_v4(), request(body)).await.unwrap();
        assert_eq!(artifact.format, ExportFormat::Obj);
        let text = std::fs::read_to_string(artifact.path).unwrap();
        assert!(text.lines().any(|l| l.starts_with("f ")));
    }

    #[tokio::test]
    async fn built_in_pipelines_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::ModelConfig {
            enable_tex: true,
            ..crate::config::ModelConfig::default()
        };
        let models = ModelSet::load(&config, "test");
        let registry = Arc::new(JobRegistry::new());
        let executor = JobExecutor::new(
            models,
            Arc::new(ConcurrencyGate::new(1)),
            Arc::new(ArtifactStore::open(dir.path()).unwrap()),
            registry,
        );
        let body = GenerateBody {
            text: Some("a small teapot".to_string()),
            texture: true,
            ..GenerateBody::default()
        };
        let capabilities = executor.models().capabilities();
        let req = normalize(body, &capabilities).unwrap();
        let artifact = executor.execute(Uuid::new_v4(), req).await.unwrap();

        let mesh = glb::decode(&std::fs::read(artifact.path).unwrap()).unwrap();
        assert!(mesh.face_count() > 0);
        assert!(mesh.face_count() <= crate::normalizer::DEFAULT_FACE_COUNT);
        assert!(mesh.colors.is_some());
    }
}
