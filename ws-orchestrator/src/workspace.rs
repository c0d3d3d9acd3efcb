use crate::error::{OrchestratorError, Result};
use crate::naming;
use crate::store::{DescriptorRecord, UsageRecord, UsageStatus};
use chrono::{DateTime, Utc};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_IMAGE: &str = "linuxserver/code-server:latest";

const SUBDOMAIN_LEN: usize = 8;
const PASSWORD_LEN: usize = 12;
const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Container waiting reasons that will not resolve without intervention.
const FATAL_WAITING_REASONS: [&str; 5] = [
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Pending,
    Provisioning,
    Running,
    Unused,
    Stopped,
    Terminating,
    Failed,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceState::Pending => "pending",
            WorkspaceState::Provisioning => "provisioning",
            WorkspaceState::Running => "running",
            WorkspaceState::Unused => "unused",
            WorkspaceState::Stopped => "stopped",
            WorkspaceState::Terminating => "terminating",
            WorkspaceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl WorkspaceState {
    /// Legal transitions. Staying in the same state is not a transition.
    pub fn can_transition_to(self, to: WorkspaceState) -> bool {
        use WorkspaceState::*;
        matches!(
            (self, to),
            (Pending, Provisioning | Terminating | Failed)
                | (Provisioning, Running | Stopped | Terminating | Failed)
                | (Running, Unused | Stopped | Terminating | Failed)
                | (Unused, Running | Stopped | Terminating)
                | (Stopped, Provisioning | Terminating)
                | (Failed, Provisioning | Stopped | Terminating)
        )
    }

    pub fn ensure_transition(self, to: WorkspaceState) -> Result<()> {
        if self == to || self.can_transition_to(to) {
            Ok(())
        } else {
            Err(OrchestratorError::IllegalTransition { from: self, to })
        }
    }
}

/// Where the workspace container image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSpec {
    Default,
    Named(String),
    /// Built inside the namespace from a build context URL before start.
    BuildFromUrl(String),
}

impl ImageSpec {
    pub fn is_custom(&self) -> bool {
        !matches!(self, ImageSpec::Default)
    }
}

/// Body of a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSource {
    pub repositories: Vec<Repository>,
    pub image: ImageSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    pub branch: Option<String>,
}

impl Repository {
    /// Directory name the repository is cloned into.
    pub fn directory(&self) -> String {
        let trimmed = self.url.trim_end_matches('/');
        let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
        let name = last.trim_end_matches(".git");
        if name.is_empty() {
            "repository".to_string()
        } else {
            name.to_string()
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl CreateWorkspaceRequest {
    pub fn validate(&self) -> Result<WorkspaceSource> {
        let mut repositories = Vec::new();
        for (i, url) in self.repositories.iter().enumerate() {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "Repository URL contains whitespace: {url:?}"
                )));
            }
            let branch = self
                .branches
                .get(i)
                .map(|b| b.trim())
                .filter(|b| !b.is_empty())
                .map(str::to_string);
            repositories.push(Repository {
                url: url.trim_end_matches('/').to_string(),
                branch,
            });
        }

        let image = match (non_blank(&self.image_url), non_blank(&self.image)) {
            (Some(url), _) => ImageSpec::BuildFromUrl(url),
            (None, Some(name)) => ImageSpec::Named(name),
            (None, None) => ImageSpec::Default,
        };

        if repositories.is_empty() && !image.is_custom() {
            return Err(OrchestratorError::InvalidInput(
                "At least one repository URL or a custom image is required".to_string(),
            ));
        }

        Ok(WorkspaceSource {
            repositories,
            image,
        })
    }
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// Randomly generated names for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    pub id: String,
    pub namespace: String,
    pub subdomain: String,
    pub fqdn: String,
    pub password: String,
}

impl WorkspaceIdentity {
    pub fn generate(domain: &str) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let subdomain = random_string(SUBDOMAIN_CHARSET, SUBDOMAIN_LEN);
        Self {
            namespace: naming::namespace_name(&id),
            fqdn: naming::base_host(&subdomain, domain),
            password: random_string(PASSWORD_CHARSET, PASSWORD_LEN),
            subdomain,
            id,
        }
    }

    pub fn url(&self) -> String {
        format!("https://{}", self.fqdn)
    }
}

/// Everything reconciliation needs to (re)build a workspace's resources.
#[derive(Debug, Clone)]
pub struct WorkspaceSpec {
    pub identity: WorkspaceIdentity,
    pub source: WorkspaceSource,
    pub created: DateTime<Utc>,
}

impl WorkspaceSpec {
    /// Descriptor for this workspace; `default_image` is the image the
    /// deployment runs when none was requested.
    pub fn descriptor(&self, default_image: &str) -> DescriptorRecord {
        let (image, image_url) = match &self.source.image {
            ImageSpec::Default => (Some(default_image.to_string()), None),
            ImageSpec::Named(name) => (Some(name.clone()), None),
            ImageSpec::BuildFromUrl(url) => (None, Some(url.clone())),
        };
        DescriptorRecord {
            id: self.identity.id.clone(),
            subdomain: self.identity.subdomain.clone(),
            fqdn: self.identity.fqdn.clone(),
            url: self.identity.url(),
            repositories: self
                .source
                .repositories
                .iter()
                .map(|r| r.url.clone())
                .collect(),
            branches: self
                .source
                .repositories
                .iter()
                .map(|r| r.branch.clone().unwrap_or_default())
                .collect(),
            image,
            image_url,
            custom_image: self.source.image.is_custom(),
            created: self.created,
            port_mappings: BTreeMap::new(),
        }
    }

    /// Rebuilds an existing workspace from its stored records.
    pub fn from_records(
        namespace: &str,
        descriptor: &DescriptorRecord,
        password: String,
        default_image: &str,
    ) -> Self {
        let repositories = descriptor
            .repositories
            .iter()
            .enumerate()
            .map(|(i, url)| Repository {
                url: url.clone(),
                branch: descriptor
                    .branches
                    .get(i)
                    .filter(|b| !b.is_empty())
                    .cloned(),
            })
            .collect();
        let image = match (&descriptor.image_url, &descriptor.image) {
            (Some(url), _) => ImageSpec::BuildFromUrl(url.clone()),
            (None, Some(name)) if descriptor.custom_image || name != default_image => {
                ImageSpec::Named(name.clone())
            }
            _ => ImageSpec::Default,
        };
        Self {
            identity: WorkspaceIdentity {
                id: descriptor.id.clone(),
                namespace: namespace.to_string(),
                subdomain: descriptor.subdomain.clone(),
                fqdn: descriptor.fqdn.clone(),
                password,
            },
            source: WorkspaceSource {
                repositories,
                image,
            },
            created: descriptor.created,
        }
    }
}

/// Returned once from create; the only time the password is handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedWorkspace {
    pub id: String,
    pub fqdn: String,
    pub url: String,
    pub password: String,
}

/// Observed view of a workspace assembled from records and live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceView {
    pub id: String,
    pub namespace: String,
    pub state: WorkspaceState,
    pub subdomain: String,
    pub fqdn: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub port_mappings: BTreeMap<u16, String>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
    pub replicas: i32,
}

/// Picks the pod that represents the workspace: not being deleted, running
/// pods first, then the newest.
pub fn primary_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .max_by_key(|p| {
            let running = pod_phase(p) == Some("Running");
            let created = p.metadata.creation_timestamp.as_ref().map(|t| t.0);
            (running, created)
        })
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}

fn has_fatal_container(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| FATAL_WAITING_REASONS.contains(&reason))
}

pub fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Reconstructs the lifecycle state from what is observable in the cluster.
pub fn derive_state(
    namespace_terminating: bool,
    deployment: Option<&Deployment>,
    pod: Option<&Pod>,
    usage: Option<&UsageRecord>,
) -> WorkspaceState {
    if namespace_terminating {
        return WorkspaceState::Terminating;
    }
    let Some(deployment) = deployment else {
        return WorkspaceState::Pending;
    };
    if desired_replicas(deployment) == 0 {
        return WorkspaceState::Stopped;
    }
    let Some(pod) = pod else {
        return WorkspaceState::Provisioning;
    };
    if has_fatal_container(pod) {
        return WorkspaceState::Failed;
    }
    match pod_phase(pod) {
        Some("Running") => match usage.map(|u| u.status) {
            Some(UsageStatus::Active) => WorkspaceState::Running,
            // A missing usage record reads as unused.
            _ => WorkspaceState::Unused,
        },
        Some("Failed") | Some("Succeeded") => WorkspaceState::Failed,
        _ => WorkspaceState::Provisioning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodStatus;

    fn deployment(replicas: i32) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn usage(status: UsageStatus) -> UsageRecord {
        UsageRecord {
            status,
            marked_at: Utc::now(),
            marked_by: "test".into(),
            reason: String::new(),
        }
    }

    #[test]
    fn terminating_is_final() {
        for to in [
            WorkspaceState::Running,
            WorkspaceState::Provisioning,
            WorkspaceState::Stopped,
            WorkspaceState::Failed,
        ] {
            assert!(!WorkspaceState::Terminating.can_transition_to(to));
            assert!(WorkspaceState::Terminating.ensure_transition(to).is_err());
        }
    }

    #[test]
    fn stop_and_restart_are_legal() {
        assert!(WorkspaceState::Running.can_transition_to(WorkspaceState::Stopped));
        assert!(WorkspaceState::Stopped.can_transition_to(WorkspaceState::Provisioning));
        assert!(WorkspaceState::Unused.can_transition_to(WorkspaceState::Running));
        assert!(!WorkspaceState::Stopped.can_transition_to(WorkspaceState::Running));
        assert!(WorkspaceState::Stopped
            .ensure_transition(WorkspaceState::Stopped)
            .is_ok());
    }

    #[test]
    fn validation_requires_repo_or_image() {
        let err = CreateWorkspaceRequest::default().validate().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        let blank = CreateWorkspaceRequest {
            repositories: vec!["  ".into()],
            image: Some(" ".into()),
            ..Default::default()
        };
        assert!(blank.validate().is_err());

        let image_only = CreateWorkspaceRequest {
            image: Some("ghcr.io/acme/dev:1".into()),
            ..Default::default()
        };
        assert_eq!(
            image_only.validate().unwrap().image,
            ImageSpec::Named("ghcr.io/acme/dev:1".into())
        );
    }

    #[test]
    fn image_url_wins_over_named_image() {
        let req = CreateWorkspaceRequest {
            repositories: vec!["https://github.com/acme/app.git/".into()],
            branches: vec!["main".into()],
            image: Some("ignored".into()),
            image_url: Some("https://github.com/acme/devimage".into()),
        };
        let source = req.validate().unwrap();
        assert_eq!(
            source.image,
            ImageSpec::BuildFromUrl("https://github.com/acme/devimage".into())
        );
        assert_eq!(source.repositories[0].url, "https://github.com/acme/app.git");
        assert_eq!(source.repositories[0].branch.as_deref(), Some("main"));
        assert_eq!(source.repositories[0].directory(), "app");
    }

    #[test]
    fn identities_are_random_and_dns_safe() {
        let a = WorkspaceIdentity::generate("ws.example.com");
        let b = WorkspaceIdentity::generate("ws.example.com");
        assert_ne!(a.id, b.id);
        assert_ne!(a.namespace, b.namespace);
        assert!(naming::is_valid_workspace_id(&a.id));
        assert_eq!(a.subdomain.len(), SUBDOMAIN_LEN);
        assert_eq!(a.password.len(), PASSWORD_LEN);
        assert_eq!(a.fqdn, format!("{}.ws.example.com", a.subdomain));
    }

    #[test]
    fn derives_states_from_observations() {
        let active = usage(UsageStatus::Active);
        let unused = usage(UsageStatus::Unused);
        assert_eq!(derive_state(true, None, None, None), WorkspaceState::Terminating);
        assert_eq!(derive_state(false, None, None, None), WorkspaceState::Pending);
        assert_eq!(
            derive_state(false, Some(&deployment(0)), None, Some(&active)),
            WorkspaceState::Stopped
        );
        assert_eq!(
            derive_state(false, Some(&deployment(1)), None, Some(&active)),
            WorkspaceState::Provisioning
        );
        assert_eq!(
            derive_state(false, Some(&deployment(1)), Some(&pod("Running")), Some(&active)),
            WorkspaceState::Running
        );
        assert_eq!(
            derive_state(false, Some(&deployment(1)), Some(&pod("Running")), Some(&unused)),
            WorkspaceState::Unused
        );
        assert_eq!(
            derive_state(false, Some(&deployment(1)), Some(&pod("Running")), None),
            WorkspaceState::Unused
        );
        assert_eq!(
            derive_state(false, Some(&deployment(1)), Some(&pod("Failed")), Some(&active)),
            WorkspaceState::Failed
        );
    }
}
