use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rocket::form::Form;
use rocket::fs::{NamedFile, TempFile};
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::json::{self, Json};
use rocket::{get, options, post, State};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::GenerationError;
use crate::executor::Artifact;
use crate::mesh::ExportFormat;
use crate::types::{
    ErrorEnvelope,
    GenerateBody,
    HealthResponse,
    MultiviewImagesBody,
    SendResponse,
    StatusResponse,
    WorkerStatusResponse,
};

/// 对外统一的错误文案，不区分失败原因
pub const SERVER_ERROR_MSG: &str =
    "**NETWORK ERROR DUE TO HIGH TRAFFIC. PLEASE REGENERATE OR REFRESH THIS PAGE.**";

pub type ApiError = Custom<Json<ErrorEnvelope>>;

/// `/` 页面所在目录
pub struct StaticDir(pub PathBuf);

fn error_envelope() -> ApiError {
    Custom(
        Status::NotFound,
        Json(ErrorEnvelope {
            text: SERVER_ERROR_MSG.to_string(),
            error_code: 1,
        }),
    )
}

fn content_type(format: ExportFormat) -> ContentType {
    match format {
        ExportFormat::Glb => ContentType::new("model", "gltf-binary"),
        ExportFormat::Obj => ContentType::new("model", "obj"),
        ExportFormat::Stl => ContentType::new("model", "stl"),
        ExportFormat::Ply => ContentType::Binary,
    }
}

async fn artifact_response(
    result: Result<Artifact, GenerationError>,
) -> Result<(ContentType, NamedFile), ApiError> {
    let artifact = result.map_err(|e| {
        error!(kind = %e.kind(), error = %e, "Generation failed");
        error_envelope()
    })?;
    let file = NamedFile::open(&artifact.path).await.map_err(|e| {
        error!(path = %artifact.path.display(), error = %e, "Artifact vanished before it was served");
        error_envelope()
    })?;
    Ok((content_type(artifact.format), file))
}

fn json_body(
    body: Result<Json<GenerateBody>, json::Error<'_>>,
    route: &str,
) -> Result<GenerateBody, ApiError> {
    body.map(Json::into_inner).map_err(|e| {
        warn!(route, error = %e, "Malformed request body");
        error_envelope()
    })
}

async fn read_upload(file: &TempFile<'_>) -> std::io::Result<Vec<u8>> {
    let reader = file.open().await?;
    tokio::pin!(reader);
    let mut bytes = Vec::with_capacity(file.len() as usize);
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

async fn upload_base64(file: &TempFile<'_>, field: &str) -> Result<String, ApiError> {
    let bytes = read_upload(file).await.map_err(|e| {
        warn!(field, error = %e, "Failed to read uploaded file");
        error_envelope()
    })?;
    Ok(STANDARD.encode(bytes))
}

#[get("/health")]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[get("/worker_status")]
pub async fn worker_status(state: &State<Arc<AppState>>) -> Json<WorkerStatusResponse> {
    Json(state.worker_status())
}

#[get("/")]
pub async fn index(static_dir: &State<StaticDir>) -> Option<NamedFile> {
    NamedFile::open(static_dir.0.join("index.html")).await.ok()
}

#[post("/generate", data = "<body>")]
pub async fn generate(
    state: &State<Arc<AppState>>,
    body: Result<Json<GenerateBody>, json::Error<'_>>,
) -> Result<(ContentType, NamedFile), ApiError> {
    info!("Worker generating...");
    let body = json_body(body, "/generate")?;
    artifact_response(state.generate(body).await).await
}

#[derive(FromForm)]
pub struct ImageForm<'r> {
    pub image: TempFile<'r>,
    #[field(default = 1234)]
    pub seed: u64,
    #[field(default = 128)]
    pub octree_resolution: u32,
    #[field(default = 5)]
    pub num_inference_steps: u32,
    #[field(default = 5.0)]
    pub guidance_scale: f32,
    #[field(default = false)]
    pub texture: bool,
    #[field(default = 40000)]
    pub face_count: usize,
}

#[post("/generate-form", data = "<form>")]
pub async fn generate_form(
    state: &State<Arc<AppState>>,
    form: Form<ImageForm<'_>>,
) -> Result<(ContentType, NamedFile), ApiError> {
    info!("Worker generating from form...");
    let body = GenerateBody {
        image: Some(upload_base64(&form.image, "image").await?),
        seed: Some(form.seed),
        octree_resolution: Some(form.octree_resolution),
        num_inference_steps: Some(form.num_inference_steps),
        guidance_scale: Some(form.guidance_scale),
        texture: form.texture,
        face_count: Some(form.face_count),
        ..GenerateBody::default()
    };
    artifact_response(state.generate(body).await).await
}

#[derive(FromForm)]
pub struct MultiviewForm<'r> {
    pub front_image: TempFile<'r>,
    pub left_image: TempFile<'r>,
    pub back_image: TempFile<'r>,
    #[field(default = 12345)]
    pub seed: u64,
    #[field(default = 380)]
    pub octree_resolution: u32,
    #[field(default = 50)]
    pub num_inference_steps: u32,
    #[field(default = 20000)]
    pub num_chunks: u32,
    #[field(default = 5.0)]
    pub guidance_scale: f32,
    #[field(default = false)]
    pub texture: bool,
    #[field(default = 40000)]
    pub face_count: usize,
}

#[post("/generate-multiview-form", data = "<form>")]
pub async fn generate_multiview_form(
    state: &State<Arc<AppState>>,
    form: Form<MultiviewForm<'_>>,
) -> Result<(ContentType, NamedFile), ApiError> {
    info!("Worker generating from multiview form...");
    let images = MultiviewImagesBody {
        front: Some(upload_base64(&form.front_image, "front_image").await?),
        left: Some(upload_base64(&form.left_image, "left_image").await?),
        back: Some(upload_base64(&form.back_image, "back_image").await?),
    };
    let body = GenerateBody {
        multiview: true,
        images: Some(images),
        seed: Some(form.seed),
        octree_resolution: Some(form.octree_resolution),
        num_inference_steps: Some(form.num_inference_steps),
        num_chunks: Some(form.num_chunks),
        guidance_scale: Some(form.guidance_scale),
        texture: form.texture,
        face_count: Some(form.face_count),
        ..GenerateBody::default()
    };
    artifact_response(state.generate(body).await).await
}

#[post("/send", data = "<body>")]
pub async fn send(
    state: &State<Arc<AppState>>,
    body: Result<Json<GenerateBody>, json::Error<'_>>,
) -> Result<Json<SendResponse>, ApiError> {
    info!("Worker send...");
    let body = json_body(body, "/send")?;
    let uid = state.submit(body);
    Ok(Json(SendResponse { uid }))
}

#[get("/status/<uid>")]
pub async fn status(
    state: &State<Arc<AppState>>,
    uid: &str,
) -> Result<Json<StatusResponse>, ApiError> {
    // 只接受 uuid，防止路径穿越
    let uid = Uuid::parse_str(uid).map_err(|_| {
        warn!(uid, "Status requested for a malformed uid");
        error_envelope()
    })?;
    state.status(&uid).await.map(Json).map_err(|e| {
        error!(%uid, error = %e, "Failed to read job status");
        error_envelope()
    })
}

/// CORS 预检
#[options("/<_..>")]
pub async fn preflight() -> Status {
    Status::NoContent
}
