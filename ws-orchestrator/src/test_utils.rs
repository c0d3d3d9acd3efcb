//! Fixtures shared by the test suites of this and the dependent crates.

use crate::cluster::fake::FakeCluster;
use crate::cluster::ClusterApi;
use crate::controller::{ControllerConfig, WorkspaceController};
use crate::error::{OrchestratorError, Result};
use crate::naming;
use crate::usage::{HealthProbe, HealthReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const TEST_DOMAIN: &str = "ws.example.com";

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        domain: TEST_DOMAIN.to_string(),
        ..ControllerConfig::default()
    }
}

/// A fake cluster holding the system namespace and its wildcard TLS secret.
pub async fn fake_cluster() -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::new());
    let config = test_config();
    cluster
        .insert_namespace(Namespace {
            metadata: ObjectMeta {
                name: Some(config.system_namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        })
        .await;
    cluster
        .insert_secret(
            &config.system_namespace,
            Secret {
                metadata: ObjectMeta {
                    name: Some(config.tls_secret.clone()),
                    namespace: Some(config.system_namespace.clone()),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/tls".to_string()),
                data: Some(BTreeMap::from([
                    ("tls.crt".to_string(), ByteString(b"cert".to_vec())),
                    ("tls.key".to_string(), ByteString(b"key".to_vec())),
                ])),
                ..Default::default()
            },
        )
        .await;
    cluster
}

/// Controller over a fresh [`fake_cluster`].
pub async fn test_controller() -> (Arc<FakeCluster>, WorkspaceController) {
    let cluster = fake_cluster().await;
    let controller = WorkspaceController::new(
        cluster.clone() as Arc<dyn ClusterApi>,
        test_config(),
    );
    (cluster, controller)
}

/// A running primary workspace pod.
pub fn running_pod(name: &str, ip: &str, created: DateTime<Utc>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                (
                    naming::COMPONENT_LABEL.to_string(),
                    naming::WORKSPACE_CONTAINER.to_string(),
                ),
                (
                    naming::APP_LABEL.to_string(),
                    naming::APP_WORKSPACE.to_string(),
                ),
            ])),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Health probe answering from a table keyed by pod IP. Unknown IPs fail.
#[derive(Default)]
pub struct StaticHealthProbe {
    reports: Mutex<HashMap<String, std::result::Result<HealthReport, String>>>,
}

impl StaticHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_hit(&self, ip: &str, last_hit: Option<DateTime<Utc>>) {
        self.set_report(ip, HealthReport { ok: true, last_hit });
    }

    pub fn set_report(&self, ip: &str, report: HealthReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(ip.to_string(), Ok(report));
        }
    }

    pub fn set_failure(&self, ip: &str, message: &str) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(ip.to_string(), Err(message.to_string()));
        }
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn check(&self, pod_ip: &str) -> Result<HealthReport> {
        let entry = self
            .reports
            .lock()
            .map_err(|e| OrchestratorError::Health(e.to_string()))?
            .get(pod_ip)
            .cloned();
        match entry {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(OrchestratorError::Health(message)),
            None => Err(OrchestratorError::Health(format!(
                "{pod_ip}: connection refused"
            ))),
        }
    }
}
