#[macro_use]
extern crate rocket;

pub mod api;
pub mod app_state;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod cors;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod job_registry;
pub mod logging;
pub mod mesh;
pub mod normalizer;
pub mod types;

use std::sync::Arc;

use rocket::data::{ByteUnit, Limits};
use rocket::fs::FileServer;
use rocket::{Build, Rocket};
use tracing::warn;

use api::{
    generate,
    generate_form,
    generate_multiview_form,
    health,
    index,
    preflight,
    send,
    status,
    worker_status,
    StaticDir,
};
use app_state::AppState;
use config::HttpConfig;
use cors::Cors;

/// 组装 Rocket 实例；测试直接拿它构造本地客户端
pub fn build_rocket(state: Arc<AppState>, http: &HttpConfig) -> Rocket<Build> {
    let upload = ByteUnit::from(http.max_upload_bytes);
    let limits = Limits::default()
        .limit("json", upload)
        .limit("file", upload)
        .limit("data-form", upload)
        .limit("bytes", upload);

    let figment = rocket::Config::figment()
        .merge(("address", http.host))
        .merge(("port", http.port))
        .merge(("limits", limits));

    let mut rocket = rocket::custom(figment)
        .manage(state)
        .manage(StaticDir(http.static_dir.clone()))
        .mount(
            "/",
            routes![
                health,
                worker_status,
                index,
                generate,
                generate_form,
                generate_multiview_form,
                send,
                status,
                preflight,
            ],
        )
        .attach(Cors);

    if http.static_dir.is_dir() {
        rocket = rocket.mount("/static", FileServer::from(&http.static_dir));
    } else {
        warn!(dir = %http.static_dir.display(), "Static directory missing, /static is not served");
    }
    rocket
}
