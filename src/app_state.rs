use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::config::ServerConfig;
use crate::engine::ModelSet;
use crate::error::GenerationError;
use crate::executor::{Artifact, JobExecutor};
use crate::gate::ConcurrencyGate;
use crate::job_registry::{JobRegistry, JobState};
use crate::mesh::ExportFormat;
use crate::normalizer::{normalize, Capabilities};
use crate::types::{GenerateBody, StatusResponse, WorkerStatusResponse};

/// 全局共享状态：
/// - executor: 执行生成任务，持有模型管线
/// - gate: 控制最多 N 个任务同时占用设备
/// - registry: 记录异步任务的状态和失败原因
/// - artifacts: 结果文件目录
pub struct AppState {
    pub worker_id: String,
    executor: JobExecutor,
    gate: Arc<ConcurrencyGate>,
    registry: Arc<JobRegistry>,
    artifacts: Arc<ArtifactStore>,
    capabilities: Capabilities,
}

impl AppState {
    pub fn new(
        worker_id: impl Into<String>,
        models: ModelSet,
        limit_model_concurrency: usize,
        artifacts: ArtifactStore,
    ) -> Arc<Self> {
        let capabilities = models.capabilities();
        let gate = Arc::new(ConcurrencyGate::new(limit_model_concurrency));
        let registry = Arc::new(JobRegistry::new());
        let artifacts = Arc::new(artifacts);
        let executor = JobExecutor::new(
            models,
            Arc::clone(&gate),
            Arc::clone(&artifacts),
            Arc::clone(&registry),
        );

        Arc::new(Self {
            worker_id: worker_id.into(),
            executor,
            gate,
            registry,
            artifacts,
            capabilities,
        })
    }

    pub fn from_config(config: &ServerConfig) -> std::io::Result<Arc<Self>> {
        let artifacts = ArtifactStore::open(&config.storage.cache_dir)?;
        let models = ModelSet::load(&config.models, &config.worker_id);
        info!(
            worker_id = %config.worker_id,
            limit_model_concurrency = config.limit_model_concurrency,
            cache_dir = %config.storage.cache_dir.display(),
            "Worker ready"
        );
        Ok(Self::new(
            config.worker_id.clone(),
            models,
            config.limit_model_concurrency,
            artifacts,
        ))
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// 同步生成：排队、执行，返回结果文件。
    /// uid 不对外暴露，记录只在执行期间保留。
    pub async fn generate(&self, body: GenerateBody) -> Result<Artifact, GenerationError> {
        let request = normalize(body, &self.capabilities)?;
        let uid = Uuid::new_v4();
        self.registry.register(uid);
        let _forget = ForgetJob {
            registry: &self.registry,
            uid,
        };
        self.registry.set_mode(&uid, request.mode_tag());
        self.executor.execute(uid, request).await
    }

    /// 异步提交：立即返回 uid，生成在后台进行。
    /// 参数错误和执行错误都记录到注册表，由 `/status` 查询。
    pub fn submit(self: &Arc<Self>, body: GenerateBody) -> Uuid {
        let uid = Uuid::new_v4();
        self.registry.register(uid);

        let request = match normalize(body, &self.capabilities) {
            Ok(request) => request,
            Err(e) => {
                warn!(%uid, kind = %e.kind(), error = %e, "Rejected submitted job");
                self.registry.mark_failed(&uid, &e);
                return uid;
            }
        };
        self.registry.set_mode(&uid, request.mode_tag());

        let state = Arc::clone(self);
        tokio::spawn(async move {
            let worker = {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.executor.execute(uid, request).await })
            };
            // execute 自己记录成败；这里只兜住 panic
            if let Err(e) = worker.await {
                let e = GenerationError::from(e);
                error!(%uid, error = %e, "Job task aborted");
                state.registry.mark_failed(&uid, &e);
            }
        });

        uid
    }

    pub async fn status(&self, uid: &Uuid) -> Result<StatusResponse, GenerationError> {
        let glb = self.artifacts.path_for(uid, ExportFormat::Glb);
        if let Some(bytes) = self.artifacts.read(&glb).await? {
            return Ok(completed(bytes));
        }

        let Some(job) = self.registry.get(uid) else {
            return Ok(StatusResponse::Processing);
        };
        match job.state {
            JobState::Completed => {
                if let Some(path) = &job.artifact {
                    if let Some(bytes) = self.artifacts.read(path).await? {
                        return Ok(completed(bytes));
                    }
                }
                Ok(StatusResponse::Processing)
            }
            JobState::Failed => Ok(match job.failure {
                Some(failure) => StatusResponse::Failed {
                    error_kind: failure.kind,
                    text: failure.message,
                },
                None => StatusResponse::Processing,
            }),
            JobState::Queued | JobState::Running => Ok(StatusResponse::Processing),
        }
    }

    pub fn worker_status(&self) -> WorkerStatusResponse {
        let gate = self.gate.status();
        WorkerStatusResponse {
            worker_id: self.worker_id.clone(),
            speed: 1,
            queue_length: gate.queue_length,
            gate,
            jobs: self.registry.counts(),
        }
    }
}

/// drop 时从注册表删除同步任务的记录，请求被取消也一样
struct ForgetJob<'a> {
    registry: &'a JobRegistry,
    uid: Uuid,
}

impl Drop for ForgetJob<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.uid);
    }
}

fn completed(bytes: Vec<u8>) -> StatusResponse {
    StatusResponse::Completed {
        model_base64: STANDARD.encode(bytes),
    }
}
