use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use ws_api::{create_app, start_usage_tracker_task, AppState, Config};
use ws_orchestrator::{HttpHealthProbe, KubeCluster, UsageTracker, WorkspaceController};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    info!("Starting ws-api service...");

    let config = Config::from_env();
    if config.domain.is_empty() {
        anyhow::bail!("WS_DOMAIN must be set");
    }
    info!(
        "Configuration loaded: bind_addr={}, domain={}, system_namespace={}",
        config.bind_addr, config.domain, config.system_namespace
    );

    let cluster = Arc::new(KubeCluster::try_default("ws-controller").await?);
    let controller = WorkspaceController::new(cluster.clone(), config.controller_config());

    let tracker = UsageTracker::new(
        cluster,
        Arc::new(HttpHealthProbe::new()?),
        config.tracker_config(),
    );
    tokio::spawn(start_usage_tracker_task(
        tracker,
        config.tracker_interval_secs,
    ));
    info!(
        "Usage tracker started (interval: {}s)",
        config.tracker_interval_secs
    );

    if config.api_token.is_none() {
        info!("WS_API_TOKEN not set, workspace routes are unauthenticated");
    }
    let app = create_app(AppState::new(controller, config.api_token.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ws-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
