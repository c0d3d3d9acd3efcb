//! Cluster access seam.
//!
//! Everything the controller, the port exposer and the usage tracker need
//! from the cluster goes through [`ClusterApi`]. The production
//! implementation talks to the Kubernetes API server; tests use the
//! in-memory [`fake::FakeCluster`].

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{
        ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
        ServicePort,
    },
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use thiserror::Error;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod kubernetes;

pub use self::kubernetes::KubeCluster;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency failure: the object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("api error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::Api(_))
    }
}

/// A desired-state object that is upserted with [`ClusterApi::apply`].
#[derive(Debug, Clone)]
pub enum Manifest {
    Namespace(Namespace),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Secret(Secret),
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
}

/// Pod template annotation whose change makes the deployment roll its pods.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Namespace(_) => "Namespace",
            Manifest::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            Manifest::Secret(_) => "Secret",
            Manifest::ServiceAccount(_) => "ServiceAccount",
            Manifest::Role(_) => "Role",
            Manifest::RoleBinding(_) => "RoleBinding",
            Manifest::Deployment(_) => "Deployment",
            Manifest::Service(_) => "Service",
            Manifest::Ingress(_) => "Ingress",
        }
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Manifest::Namespace(o) => &o.metadata,
            Manifest::PersistentVolumeClaim(o) => &o.metadata,
            Manifest::Secret(o) => &o.metadata,
            Manifest::ServiceAccount(o) => &o.metadata,
            Manifest::Role(o) => &o.metadata,
            Manifest::RoleBinding(o) => &o.metadata,
            Manifest::Deployment(o) => &o.metadata,
            Manifest::Service(o) => &o.metadata,
            Manifest::Ingress(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> ClusterResult<&str> {
        self.meta()
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Invalid(format!("{} without a name", self.kind())))
    }

    /// Owning namespace; `None` for the namespace object itself.
    pub fn namespace(&self) -> ClusterResult<Option<&str>> {
        if let Manifest::Namespace(_) = self {
            return Ok(None);
        }
        self.meta()
            .namespace
            .as_deref()
            .map(Some)
            .ok_or_else(|| ClusterError::Invalid(format!("{} without a namespace", self.kind())))
    }
}

/// Operations the workspace components perform against the cluster.
///
/// Reads return `Ok(None)` for absent objects. Creates fail with
/// [`ClusterError::AlreadyExists`]; guarded replaces fail with
/// [`ClusterError::Conflict`] when the resource version is stale.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Idempotent upsert of a desired-state object.
    async fn apply(&self, manifest: &Manifest) -> ClusterResult<()>;

    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<Namespace>>;
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>>;
    /// Strict create; used to claim a freshly generated namespace name.
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()>;
    /// Returns `false` when the namespace was already gone.
    async fn delete_namespace(&self, name: &str) -> ClusterResult<bool>;

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()>;

    async fn get_config_map(&self, namespace: &str, name: &str)
        -> ClusterResult<Option<ConfigMap>>;
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap>;
    /// Replace guarded by `metadata.resourceVersion`.
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> ClusterResult<Option<Deployment>>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32)
        -> ClusterResult<()>;
    /// Rolls the deployment's pods by stamping the pod template with
    /// `restarted_at`.
    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        restarted_at: &str,
    ) -> ClusterResult<()>;
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>>;
    /// The last `tail_lines` lines of a container's log.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: i64,
    ) -> ClusterResult<String>;

    async fn get_service(&self, namespace: &str, name: &str) -> ClusterResult<Option<Service>>;
    /// Adds a port to an existing service, merging on the port number.
    async fn add_service_port(
        &self,
        namespace: &str,
        name: &str,
        port: &ServicePort,
    ) -> ClusterResult<()>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> ClusterResult<Option<Ingress>>;

    /// Runs a command in a pod container and returns its stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<String>;
}
