//! Background usage tracker task

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use ws_api::start_usage_tracker_task;
use ws_orchestrator::test_utils::{running_pod, test_controller, StaticHealthProbe};
use ws_orchestrator::{
    ClusterApi, CreateWorkspaceRequest, TrackerConfig, UsageStatus, UsageTracker,
};

#[tokio::test]
async fn test_zero_interval_keeps_scanning() {
    let (cluster, controller) = test_controller().await;
    let created = controller
        .create(CreateWorkspaceRequest {
            image: Some("ghcr.io/acme/dev:1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let namespace = format!("workspace-{}", created.id);
    cluster
        .insert_pod(&namespace, running_pod("workspace-0", "10.0.2.1", Utc::now()))
        .await;

    let health = Arc::new(StaticHealthProbe::new());
    health.set_last_hit("10.0.2.1", Some(Utc::now() - ChronoDuration::hours(2)));
    let tracker = UsageTracker::new(
        cluster.clone() as Arc<dyn ClusterApi>,
        health,
        TrackerConfig {
            threshold_hours: 1.0,
            ..TrackerConfig::default()
        },
    );

    let handle = tokio::spawn(start_usage_tracker_task(tracker, 0));

    let mut marked = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let usage = controller.store().usage(&namespace).await.unwrap();
        if usage.is_some_and(|u| u.status == UsageStatus::Unused) {
            marked = true;
            break;
        }
    }

    assert!(marked, "first scan should have marked the workspace unused");
    assert!(!handle.is_finished(), "tracker task must keep running");
    handle.abort();
}
