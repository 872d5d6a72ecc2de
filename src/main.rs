use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meshgen_server::app_state::AppState;
use meshgen_server::artifacts::run_retention_daemon;
use meshgen_server::build_rocket;
use meshgen_server::cli::ServerArgs;
use meshgen_server::config::ServerConfig;
use meshgen_server::logging::init_logging;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config = ServerConfig::from_args(args)?;
    let _logging = init_logging(&config.logging).context("failed to initialise logging")?;
    info!(?config, "args");

    let state = AppState::from_config(&config).context("failed to open the cache directory")?;

    let shutdown = CancellationToken::new();
    let retention = tokio::spawn(run_retention_daemon(
        Arc::clone(state.artifacts()),
        Arc::clone(state.registry()),
        config.storage.retention,
        shutdown.clone(),
    ));

    let launched = build_rocket(state, &config.http).launch().await;

    shutdown.cancel();
    let _ = retention.await;
    launched.map_err(|e| anyhow::anyhow!("server error: {e}"))?;
    Ok(())
}
