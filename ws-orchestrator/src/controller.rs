use crate::cluster::{ClusterApi, Manifest};
use crate::error::{OrchestratorError, Result};
use crate::naming;
use crate::resources;
use crate::status::{self, LogOptions, WorkspaceLogs, WorkspaceStatus};
use crate::store::{StateStore, UsageRecord, UsageStatus};
use crate::workspace::{
    derive_state, desired_replicas, primary_pod, CreateWorkspaceRequest, CreatedWorkspace,
    WorkspaceIdentity, WorkspaceSpec, WorkspaceState, WorkspaceView, DEFAULT_IMAGE,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Attempts at claiming a fresh namespace name before giving up.
const CREATE_ATTEMPTS: u32 = 3;
pub const CONTROLLER_MARKER: &str = "controller";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub domain: String,
    pub system_namespace: String,
    pub tls_secret: String,
    pub storage_class: String,
    pub storage_size: String,
    pub default_image: String,
    pub exposer_image: String,
    pub build_image: String,
    pub git_image: String,
    pub image_registry: String,
    pub exposer_poll_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            system_namespace: "workspace-system".to_string(),
            tls_secret: "workspace-domain-wildcard-tls".to_string(),
            storage_class: "efs-sc".to_string(),
            storage_size: "10Gi".to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            exposer_image: "ghcr.io/workspace-controller/ws-port-exposer:latest".to_string(),
            build_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            git_image: "alpine/git:latest".to_string(),
            image_registry: "registry.workspace-system.svc.cluster.local:5000".to_string(),
            exposer_poll_interval_secs: 30,
        }
    }
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace.metadata.deletion_timestamp.is_some()
        || namespace.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating")
}

#[derive(Clone)]
pub struct WorkspaceController {
    cluster: Arc<dyn ClusterApi>,
    store: StateStore,
    config: Arc<ControllerConfig>,
}

impl WorkspaceController {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ControllerConfig) -> Self {
        Self {
            store: StateStore::new(cluster.clone()),
            cluster,
            config: Arc::new(config),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Create a new workspace and provision everything it needs
    pub async fn create(&self, req: CreateWorkspaceRequest) -> Result<CreatedWorkspace> {
        let source = req.validate()?;
        if self.config.domain.is_empty() {
            return Err(OrchestratorError::InvalidState(
                "workspace domain is not configured".to_string(),
            ));
        }

        let mut claimed = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            let spec = WorkspaceSpec {
                identity: WorkspaceIdentity::generate(&self.config.domain),
                source: source.clone(),
                created: Utc::now(),
            };
            // A strict create: an existing namespace is never adopted.
            match self
                .cluster
                .create_namespace(&resources::namespace(&spec))
                .await
            {
                Ok(()) => {
                    claimed = Some(spec);
                    break;
                }
                Err(err) if err.is_already_exists() => {
                    warn!(
                        namespace = %spec.identity.namespace,
                        attempt,
                        "generated workspace id collided, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        let spec = claimed.ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "could not claim a unique workspace id after {CREATE_ATTEMPTS} attempts"
            ))
        })?;

        info!(
            id = %spec.identity.id,
            fqdn = %spec.identity.fqdn,
            "creating workspace"
        );

        if let Err(err) = self.reconcile(&spec).await {
            error!(
                id = %spec.identity.id,
                error = %err,
                "workspace provisioning incomplete; repair will resume it"
            );
            return Err(err);
        }

        Ok(CreatedWorkspace {
            url: spec.identity.url(),
            id: spec.identity.id,
            fqdn: spec.identity.fqdn,
            password: spec.identity.password,
        })
    }

    /// Bring every resource of `spec` to its desired state.
    ///
    /// Each step is an upsert or a create-if-absent, so running the pass again
    /// after a partial failure converges. An existing deployment keeps its
    /// replica count.
    #[instrument(skip(self, spec), fields(namespace = %spec.identity.namespace))]
    pub async fn reconcile(&self, spec: &WorkspaceSpec) -> Result<()> {
        let namespace = spec.identity.namespace.as_str();

        self.cluster
            .apply(&Manifest::Namespace(resources::namespace(spec)))
            .await?;

        match self
            .cluster
            .create_secret(namespace, &resources::password_secret(spec))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err.into()),
        }

        self.store
            .ensure_descriptor(namespace, &spec.descriptor(&self.config.default_image))
            .await?;
        self.store
            .seed_usage(
                namespace,
                &UsageRecord::new(UsageStatus::Active, CONTROLLER_MARKER, "workspace created"),
            )
            .await?;

        if let Err(err) = resources::ensure_tls_secret(
            self.cluster.as_ref(),
            &self.config.system_namespace,
            &self.config.tls_secret,
            namespace,
        )
        .await
        {
            warn!(error = %err, "could not copy TLS secret; ingress will serve the default certificate");
        }

        let current_replicas = self
            .cluster
            .get_deployment(namespace, naming::DEPLOYMENT_NAME)
            .await?
            .map(|d| desired_replicas(&d));

        for mut manifest in resources::manifests(spec, &self.config) {
            if let (Manifest::Deployment(deployment), Some(replicas)) =
                (&mut manifest, current_replicas)
            {
                if let Some(s) = deployment.spec.as_mut() {
                    s.replicas = Some(replicas);
                }
            }
            self.cluster.apply(&manifest).await?;
        }

        info!("workspace reconciled");
        Ok(())
    }

    /// Re-run reconciliation for an existing workspace from its stored records
    pub async fn repair(&self, id: &str) -> Result<WorkspaceView> {
        let namespace = self.namespace_for(id)?;
        let ns = self
            .cluster
            .get_namespace(&namespace)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if is_terminating(&ns) {
            return Err(OrchestratorError::IllegalTransition {
                from: WorkspaceState::Terminating,
                to: WorkspaceState::Provisioning,
            });
        }

        let descriptor = self.store.descriptor(&namespace).await?.ok_or_else(|| {
            OrchestratorError::MalformedRecord {
                namespace: namespace.clone(),
                record: naming::DESCRIPTOR_CONFIG_MAP,
                reason: "missing".to_string(),
            }
        })?;

        let password = match self
            .cluster
            .get_secret(&namespace, naming::SECRET_NAME)
            .await?
        {
            Some(secret) => resources::secret_password(&secret).unwrap_or_default(),
            None => {
                warn!(%namespace, "workspace secret is gone; a new password will be generated");
                WorkspaceIdentity::generate(&self.config.domain).password
            }
        };

        let spec = WorkspaceSpec::from_records(
            &namespace,
            &descriptor,
            password,
            &self.config.default_image,
        );
        self.reconcile(&spec).await?;
        self.get(id).await
    }

    /// Scale a workspace up and mark it active
    pub async fn start(&self, id: &str) -> Result<WorkspaceState> {
        let (namespace, current) = self.observe(id).await?;
        let target = match current {
            WorkspaceState::Pending => {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {id} has no deployment yet; repair it first"
                )))
            }
            WorkspaceState::Stopped | WorkspaceState::Failed => WorkspaceState::Provisioning,
            WorkspaceState::Provisioning => WorkspaceState::Provisioning,
            WorkspaceState::Running | WorkspaceState::Unused => WorkspaceState::Running,
            WorkspaceState::Terminating => WorkspaceState::Provisioning,
        };
        current.ensure_transition(target)?;

        if current != target && current != WorkspaceState::Unused {
            self.cluster
                .scale_deployment(&namespace, naming::DEPLOYMENT_NAME, 1)
                .await?;
        }
        // Also runs when already in the target state so a retry after a
        // failed usage write converges.
        self.store
            .mark_usage(&namespace, UsageStatus::Active, CONTROLLER_MARKER, "started")
            .await?;
        if current != target {
            info!(id, from = %current, to = %target, "workspace started");
        }
        Ok(target)
    }

    /// Scale a workspace to zero; its volume is kept
    pub async fn stop(&self, id: &str) -> Result<WorkspaceState> {
        let (namespace, current) = self.observe(id).await?;
        let target = WorkspaceState::Stopped;
        current.ensure_transition(target)?;

        if current != target {
            self.cluster
                .scale_deployment(&namespace, naming::DEPLOYMENT_NAME, 0)
                .await?;
        }
        self.store
            .mark_usage(&namespace, UsageStatus::Unused, CONTROLLER_MARKER, "stopped")
            .await?;
        if current != target {
            info!(id, from = %current, "workspace stopped");
        }
        Ok(target)
    }

    /// Roll the workspace pod; the volume and records are kept
    pub async fn restart(&self, id: &str) -> Result<WorkspaceState> {
        let (namespace, current) = self.observe(id).await?;
        match current {
            WorkspaceState::Terminating => {
                return Err(OrchestratorError::IllegalTransition {
                    from: current,
                    to: WorkspaceState::Provisioning,
                })
            }
            WorkspaceState::Pending | WorkspaceState::Stopped => {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {id} is {current}; start it instead"
                )))
            }
            _ => {}
        }

        self.cluster
            .restart_deployment(
                &namespace,
                naming::DEPLOYMENT_NAME,
                &Utc::now().to_rfc3339(),
            )
            .await?;
        info!(id, state = %current, "workspace restart initiated");
        Ok(current)
    }

    /// Tail the log of a container in the workspace pod
    pub async fn logs(&self, id: &str, options: &LogOptions) -> Result<WorkspaceLogs> {
        let (namespace, _) = self.observe(id).await?;
        let pods = self
            .cluster
            .list_pods(&namespace, naming::WORKSPACE_POD_SELECTOR)
            .await?;
        let pod = primary_pod(&pods)
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!("no pods found for workspace {id}"))
            })?;
        let container = options
            .container
            .clone()
            .unwrap_or_else(|| naming::WORKSPACE_CONTAINER.to_string());

        let logs = self
            .cluster
            .pod_logs(&namespace, &pod, &container, options.tail_lines())
            .await?;
        Ok(WorkspaceLogs {
            id: id.to_string(),
            namespace,
            pod,
            container,
            logs,
        })
    }

    /// Detailed deployment, pod and service status for troubleshooting
    pub async fn status(&self, id: &str) -> Result<WorkspaceStatus> {
        let (namespace, state) = self.observe(id).await?;
        let deployment = self
            .cluster
            .get_deployment(&namespace, naming::DEPLOYMENT_NAME)
            .await?;
        let pods = self
            .cluster
            .list_pods(&namespace, naming::WORKSPACE_POD_SELECTOR)
            .await?;
        let service = self
            .cluster
            .get_service(&namespace, naming::SERVICE_NAME)
            .await?;

        Ok(WorkspaceStatus {
            id: id.to_string(),
            namespace,
            state,
            deployment: deployment.as_ref().map(status::deployment_summary),
            pods: pods.iter().map(status::pod_summary).collect(),
            service: service.as_ref().map(status::service_summary),
        })
    }

    /// Delete a workspace namespace and everything in it. Returns `false` if
    /// it was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let namespace = self.namespace_for(id)?;
        let deleted = self.cluster.delete_namespace(&namespace).await?;
        if deleted {
            info!(id, %namespace, "workspace deleted");
        } else {
            info!(id, %namespace, "workspace already absent");
        }
        Ok(deleted)
    }

    /// Get a single workspace by ID
    pub async fn get(&self, id: &str) -> Result<WorkspaceView> {
        let namespace = self.namespace_for(id)?;
        let ns = self
            .cluster
            .get_namespace(&namespace)
            .await?
            .filter(|ns| {
                ns.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(naming::APP_LABEL))
                    .is_some_and(|v| v == naming::APP_WORKSPACE)
            })
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        self.view(&ns).await
    }

    /// List every workspace; namespaces whose records cannot be read are skipped
    pub async fn list(&self) -> Result<Vec<WorkspaceView>> {
        let namespaces = self
            .cluster
            .list_namespaces(naming::WORKSPACE_NAMESPACE_SELECTOR)
            .await?;

        let mut views = Vec::with_capacity(namespaces.len());
        for ns in &namespaces {
            match self.view(ns).await {
                Ok(view) => views.push(view),
                Err(err) => warn!(
                    namespace = ns.metadata.name.as_deref().unwrap_or_default(),
                    error = %err,
                    "skipping workspace"
                ),
            }
        }
        views.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(views)
    }

    fn namespace_for(&self, id: &str) -> Result<String> {
        if !naming::is_valid_workspace_id(id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "Invalid workspace id: {id:?}"
            )));
        }
        Ok(naming::namespace_name(id))
    }

    async fn observe(&self, id: &str) -> Result<(String, WorkspaceState)> {
        let view = self.get(id).await?;
        Ok((view.namespace, view.state))
    }

    async fn view(&self, ns: &Namespace) -> Result<WorkspaceView> {
        let namespace = ns
            .metadata
            .name
            .clone()
            .ok_or_else(|| OrchestratorError::InvalidInput("namespace without a name".into()))?;

        let descriptor = self.store.descriptor(&namespace).await?.ok_or_else(|| {
            OrchestratorError::MalformedRecord {
                namespace: namespace.clone(),
                record: naming::DESCRIPTOR_CONFIG_MAP,
                reason: "missing".to_string(),
            }
        })?;

        let usage = match self.store.usage(&namespace).await {
            Ok(usage) => usage,
            Err(err) => {
                warn!(%namespace, error = %err, "ignoring unreadable usage record");
                None
            }
        };

        let deployment = self
            .cluster
            .get_deployment(&namespace, naming::DEPLOYMENT_NAME)
            .await?;
        let pods = self
            .cluster
            .list_pods(&namespace, naming::WORKSPACE_POD_SELECTOR)
            .await?;
        let pod = primary_pod(&pods);

        let state = derive_state(is_terminating(ns), deployment.as_ref(), pod, usage.as_ref());

        Ok(WorkspaceView {
            id: descriptor.id,
            namespace,
            state,
            subdomain: descriptor.subdomain,
            fqdn: descriptor.fqdn,
            url: descriptor.url,
            repositories: descriptor.repositories,
            image: descriptor.image,
            image_url: descriptor.image_url,
            port_mappings: descriptor.port_mappings,
            created: descriptor.created,
            usage,
            replicas: deployment.as_ref().map(desired_replicas).unwrap_or(0),
        })
    }
}
