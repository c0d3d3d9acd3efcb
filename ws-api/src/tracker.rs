use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use ws_orchestrator::UsageTracker;

/// Runs a usage scan every `interval_secs` seconds, forever. An interval of
/// zero is raised to one second.
pub async fn start_usage_tracker_task(tracker: UsageTracker, interval_secs: u64) {
    if interval_secs == 0 {
        warn!("Usage tracker interval of 0 seconds raised to 1");
    }
    let interval_secs = interval_secs.max(1);
    let mut interval = interval(Duration::from_secs(interval_secs));

    info!(
        "Usage tracker running (scans every {} seconds, idle after {}h)",
        interval_secs,
        tracker.config().threshold_hours
    );

    loop {
        interval.tick().await;

        if let Err(e) = run_scan(&tracker).await {
            error!("Usage scan failed: {}", e);
        }
    }
}

async fn run_scan(tracker: &UsageTracker) -> anyhow::Result<()> {
    let report = tracker.scan().await?;
    let summary = &report.summary;

    if summary.errors > 0 {
        warn!(
            "Usage scan finished with {} errors ({} marked unused, {} kept active, {} skipped)",
            summary.errors, summary.marked_unused, summary.kept_active, summary.skipped
        );
    } else {
        info!(
            "Usage scan finished: {} marked unused, {} kept active, {} skipped",
            summary.marked_unused, summary.kept_active, summary.skipped
        );
    }

    Ok(())
}
