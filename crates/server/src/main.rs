use std::{net::SocketAddr, sync::Arc};

use detection::{DetectionService, HttpDetectionService, ScriptedDetectionService};
use lifecycle::{recover_stalled_analyses, ApiContext};
use storage::{FsTransferBackend, Storage};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = build_context(&settings, storage)?;
    let reverted = recover_stalled_analyses(&api)
        .await
        .map_err(|err| anyhow::anyhow!("stalled-analysis recovery failed: {err}"))?;
    if !reverted.is_empty() {
        info!(count = reverted.len(), "returned stalled analyses to uploaded");
    }
    tokio::spawn(sweep_stalled_analyses(api.clone()));

    let (events, _) = broadcast::channel(256);
    let app = api::build_router(Arc::new(AppState { api, events }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Claims younger than the timeout survive startup recovery; this picks them up once they
/// age out.
async fn sweep_stalled_analyses(api: ApiContext) {
    let mut ticker = tokio::time::interval(api.analysis_timeout);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = recover_stalled_analyses(&api).await {
            warn!(error = %err, "stalled-analysis sweep failed");
        }
    }
}

fn build_context(settings: &Settings, storage: Storage) -> anyhow::Result<ApiContext> {
    Ok(ApiContext {
        storage,
        transfers: Arc::new(FsTransferBackend::new(
            settings.blob_dir.clone(),
            settings.upload_chunk_bytes,
        )),
        detector: select_detector(settings)?,
        upload_policy: settings.upload_policy(),
        analysis_timeout: settings.analysis_timeout,
    })
}

fn select_detector(settings: &Settings) -> anyhow::Result<Arc<dyn DetectionService>> {
    match &settings.detection_url {
        Some(url) => {
            let client = HttpDetectionService::new(url)?;
            info!(endpoint = %client.endpoint(), "using detection service");
            Ok(Arc::new(client))
        }
        None => {
            warn!("no detection service configured; serving scripted detections");
            Ok(Arc::new(ScriptedDetectionService::demo()))
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
