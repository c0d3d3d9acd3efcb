//! Integration tests for the idle/usage tracker

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use ws_orchestrator::cluster::fake::FakeCluster;
use ws_orchestrator::test_utils::{running_pod, test_controller, StaticHealthProbe};
use ws_orchestrator::usage::{HealthReport, ScanOutcome};
use ws_orchestrator::{
    ClusterApi, CreateWorkspaceRequest, TrackerConfig, UsageStatus, UsageTracker,
    WorkspaceController,
};

struct Harness {
    cluster: Arc<FakeCluster>,
    controller: WorkspaceController,
    health: Arc<StaticHealthProbe>,
    tracker: UsageTracker,
}

async fn harness() -> Harness {
    let (cluster, controller) = test_controller().await;
    let health = Arc::new(StaticHealthProbe::new());
    let tracker = UsageTracker::new(
        cluster.clone() as Arc<dyn ClusterApi>,
        health.clone(),
        TrackerConfig::default(),
    );
    Harness {
        cluster,
        controller,
        health,
        tracker,
    }
}

/// Creates a workspace with a running pod at `ip`; returns its namespace.
async fn running_workspace(h: &Harness, ip: &str) -> String {
    let created = h
        .controller
        .create(CreateWorkspaceRequest {
            repositories: vec!["https://github.com/acme/app.git".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    let namespace = format!("workspace-{}", created.id);
    h.cluster
        .insert_pod(&namespace, running_pod("workspace-0", ip, Utc::now()))
        .await;
    namespace
}

#[tokio::test]
async fn test_absent_usage_record_is_already_unused() {
    let h = harness().await;
    h.cluster
        .insert_namespace(Namespace {
            metadata: ObjectMeta {
                name: Some("workspace-legacy01".to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "workspace".to_string()),
                    ("workspaceId".to_string(), "legacy01".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;
    h.cluster
        .insert_pod(
            "workspace-legacy01",
            running_pod("workspace-0", "10.0.0.9", Utc::now()),
        )
        .await;

    let writes = h.cluster.writes().await;
    let report = h.tracker.scan().await.unwrap();

    assert_eq!(
        report.outcome_for("workspace-legacy01"),
        Some(&ScanOutcome::AlreadyUnused)
    );
    assert_eq!(h.cluster.writes().await, writes);
    assert_eq!(report.summary.skipped, 1);
}

#[tokio::test]
async fn test_old_workspace_without_traffic_is_marked_unused() {
    let h = harness().await;
    let namespace = running_workspace(&h, "10.0.0.7").await;
    h.health.set_last_hit("10.0.0.7", None);

    let report = h
        .tracker
        .scan_at(Utc::now() + Duration::hours(25))
        .await
        .unwrap();

    match report.outcome_for(&namespace) {
        Some(ScanOutcome::MarkedUnused(reason)) => {
            assert!(reason.contains("no traffic"), "{reason}");
            assert!(reason.contains("25"), "{reason}");
        }
        other => panic!("Expected MarkedUnused, got {other:?}"),
    }
    assert_eq!(report.summary.marked_unused, 1);

    let usage = h
        .controller
        .store()
        .usage(&namespace)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.status, UsageStatus::Unused);
    assert_eq!(usage.marked_by, "usage-tracker");
    assert!(usage.reason.contains("no traffic"));

    // The next pass leaves it alone.
    let writes = h.cluster.writes().await;
    let again = h
        .tracker
        .scan_at(Utc::now() + Duration::hours(26))
        .await
        .unwrap();
    assert_eq!(again.outcome_for(&namespace), Some(&ScanOutcome::AlreadyUnused));
    assert_eq!(h.cluster.writes().await, writes);
}

#[tokio::test]
async fn test_recent_traffic_keeps_workspace_active() {
    let h = harness().await;
    let namespace = running_workspace(&h, "10.0.0.8").await;
    let now = Utc::now() + Duration::hours(100);
    h.health
        .set_last_hit("10.0.0.8", Some(now - Duration::hours(1)));

    let writes = h.cluster.writes().await;
    let report = h.tracker.scan_at(now).await.unwrap();

    assert!(matches!(
        report.outcome_for(&namespace),
        Some(ScanOutcome::KeptActive(_))
    ));
    assert_eq!(report.summary.kept_active, 1);
    assert_eq!(h.cluster.writes().await, writes);
    assert_eq!(
        h.controller
            .store()
            .usage(&namespace)
            .await
            .unwrap()
            .unwrap()
            .status,
        UsageStatus::Active
    );
}

#[tokio::test]
async fn test_stale_traffic_marks_workspace_unused() {
    let h = harness().await;
    let namespace = running_workspace(&h, "10.0.0.10").await;
    let now = Utc::now() + Duration::hours(100);
    h.health
        .set_last_hit("10.0.0.10", Some(now - Duration::hours(30)));

    let report = h.tracker.scan_at(now).await.unwrap();

    match report.outcome_for(&namespace) {
        Some(ScanOutcome::MarkedUnused(reason)) => {
            assert_eq!(reason, "no traffic for ≈30.0 hours")
        }
        other => panic!("Expected MarkedUnused, got {other:?}"),
    }
    let usage = h
        .controller
        .store()
        .usage(&namespace)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.status, UsageStatus::Unused);
    assert_eq!(usage.reason, "no traffic for ≈30.0 hours");
}

#[tokio::test]
async fn test_failed_health_check_leaves_usage_untouched() {
    let h = harness().await;
    let namespace = running_workspace(&h, "10.0.0.11").await;
    h.health
        .set_failure("10.0.0.11", "http://10.0.0.11:8445/health: 500 Internal Server Error");

    let writes = h.cluster.writes().await;
    let report = h
        .tracker
        .scan_at(Utc::now() + Duration::hours(48))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome_for(&namespace),
        Some(ScanOutcome::Error(_))
    ));
    assert_eq!(report.summary.errors, 1);
    assert_eq!(h.cluster.writes().await, writes);
    assert_eq!(
        h.controller
            .store()
            .usage(&namespace)
            .await
            .unwrap()
            .unwrap()
            .status,
        UsageStatus::Active
    );
}

#[tokio::test]
async fn test_unhealthy_report_is_an_error_not_idleness() {
    let h = harness().await;
    let namespace = running_workspace(&h, "10.0.0.12").await;
    h.health.set_report(
        "10.0.0.12",
        HealthReport {
            ok: false,
            last_hit: None,
        },
    );

    let writes = h.cluster.writes().await;
    let report = h
        .tracker
        .scan_at(Utc::now() + Duration::hours(48))
        .await
        .unwrap();

    match report.outcome_for(&namespace) {
        Some(ScanOutcome::Error(error)) => assert!(error.contains("not ok"), "{error}"),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert_eq!(report.summary.marked_unused, 0);
    assert_eq!(h.cluster.writes().await, writes);
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_scan() {
    let h = harness().await;
    let broken = running_workspace(&h, "10.0.1.1").await;
    let idle = running_workspace(&h, "10.0.1.2").await;
    h.health.set_failure("10.0.1.1", "timed out after 10s");
    h.health.set_last_hit("10.0.1.2", None);

    let report = h
        .tracker
        .scan_at(Utc::now() + Duration::hours(30))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome_for(&broken),
        Some(ScanOutcome::Error(_))
    ));
    assert!(matches!(
        report.outcome_for(&idle),
        Some(ScanOutcome::MarkedUnused(_))
    ));
    assert_eq!(report.summary.errors, 1);
    assert_eq!(report.summary.marked_unused, 1);
}

#[tokio::test]
async fn test_unscannable_workspaces_are_skipped() {
    let h = harness().await;

    // No workspaceId label.
    h.cluster
        .insert_namespace(Namespace {
            metadata: ObjectMeta {
                name: Some("workspace-nolabel".to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "workspace".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;

    // Active usage record but no pod.
    let created = h
        .controller
        .create(CreateWorkspaceRequest {
            image: Some("ghcr.io/acme/dev:1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let podless = format!("workspace-{}", created.id);

    let report = h.tracker.scan().await.unwrap();

    assert!(matches!(
        report.outcome_for("workspace-nolabel"),
        Some(ScanOutcome::Skipped(_))
    ));
    assert!(matches!(
        report.outcome_for(&podless),
        Some(ScanOutcome::Skipped(_))
    ));
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.summary.errors, 0);
}
