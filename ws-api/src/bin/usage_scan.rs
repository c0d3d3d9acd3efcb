//! One-shot usage scan, for running from a CronJob instead of the API's
//! background task. Prints the report as JSON on stdout.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use ws_api::Config;
use ws_orchestrator::{HttpHealthProbe, KubeCluster, UsageTracker};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    let config = Config::from_env();
    let cluster = Arc::new(KubeCluster::try_default("ws-usage-tracker").await?);
    let tracker = UsageTracker::new(
        cluster,
        Arc::new(HttpHealthProbe::new()?),
        config.tracker_config(),
    );

    let report = tracker.scan().await?;
    info!(
        marked_unused = report.summary.marked_unused,
        kept_active = report.summary.kept_active,
        skipped = report.summary.skipped,
        errors = report.summary.errors,
        "usage scan complete"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
