//! Detailed live status and logs of a single workspace, for troubleshooting.

use crate::workspace::{desired_replicas, WorkspaceState};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerState, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_LINES: i64 = 100;
pub const MAX_LOG_LINES: i64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub conditions: Vec<ConditionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
    /// `running`, `waiting: <reason>` or `terminated: <reason>`.
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
    pub conditions: Vec<ConditionSummary>,
    pub containers: Vec<ContainerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortSummary {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePortSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub id: String,
    pub namespace: String,
    pub state: WorkspaceState,
    pub deployment: Option<DeploymentSummary>,
    pub pods: Vec<PodSummary>,
    pub service: Option<ServiceSummary>,
}

/// Which container's log to read and how much of it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogOptions {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub lines: Option<i64>,
}

impl LogOptions {
    pub fn tail_lines(&self) -> i64 {
        self.lines
            .unwrap_or(DEFAULT_LOG_LINES)
            .clamp(1, MAX_LOG_LINES)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLogs {
    pub id: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub logs: String,
}

fn container_state(state: Option<&ContainerState>) -> String {
    let Some(state) = state else {
        return "unknown".to_string();
    };
    if state.running.is_some() {
        return "running".to_string();
    }
    if let Some(waiting) = &state.waiting {
        return format!("waiting: {}", waiting.reason.as_deref().unwrap_or("unknown"));
    }
    if let Some(terminated) = &state.terminated {
        return format!(
            "terminated: {}",
            terminated.reason.as_deref().unwrap_or("unknown")
        );
    }
    "unknown".to_string()
}

pub fn deployment_summary(deployment: &Deployment) -> DeploymentSummary {
    let status = deployment.status.as_ref();
    DeploymentSummary {
        replicas: desired_replicas(deployment),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .map(|c| ConditionSummary {
                kind: c.type_.clone(),
                status: c.status.clone(),
                reason: c.reason.clone(),
                message: c.message.clone(),
            })
            .collect(),
    }
}

pub fn pod_summary(pod: &Pod) -> PodSummary {
    let status = pod.status.as_ref();
    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        conditions: status
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .map(|c| ConditionSummary {
                kind: c.type_.clone(),
                status: c.status.clone(),
                reason: c.reason.clone(),
                message: c.message.clone(),
            })
            .collect(),
        containers: status
            .and_then(|s| s.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .map(|c| ContainerSummary {
                name: c.name.clone(),
                ready: c.ready,
                restart_count: c.restart_count,
                state: container_state(c.state.as_ref()),
            })
            .collect(),
    }
}

pub fn service_summary(service: &Service) -> ServiceSummary {
    let spec = service.spec.as_ref();
    ServiceSummary {
        cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
        ports: spec
            .and_then(|s| s.ports.as_ref())
            .into_iter()
            .flatten()
            .map(|p| ServicePortSummary {
                name: p.name.clone(),
                port: p.port,
                target_port: p.target_port.as_ref().map(|t| match t {
                    IntOrString::Int(n) => n.to_string(),
                    IntOrString::String(s) => s.clone(),
                }),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerStateWaiting, ContainerStatus, PodStatus, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn tail_lines_defaults_and_clamps() {
        assert_eq!(LogOptions::default().tail_lines(), DEFAULT_LOG_LINES);
        let zero = LogOptions {
            lines: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.tail_lines(), 1);
        let huge = LogOptions {
            lines: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(huge.tail_lines(), MAX_LOG_LINES);
    }

    #[test]
    fn pod_summary_reports_waiting_reason() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("workspace-abc".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Pending".into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "workspace".into(),
                    ready: false,
                    restart_count: 3,
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = pod_summary(&pod);
        assert_eq!(summary.name, "workspace-abc");
        assert_eq!(summary.phase.as_deref(), Some("Pending"));
        assert_eq!(summary.containers[0].restart_count, 3);
        assert_eq!(summary.containers[0].state, "waiting: CrashLoopBackOff");
    }

    #[test]
    fn service_summary_lists_ports() {
        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.12".into()),
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port: 8444,
                    target_port: Some(IntOrString::Int(8444)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = service_summary(&service);
        assert_eq!(summary.cluster_ip.as_deref(), Some("10.96.0.12"));
        assert_eq!(summary.ports[0].port, 8444);
        assert_eq!(summary.ports[0].target_port.as_deref(), Some("8444"));
    }
}
