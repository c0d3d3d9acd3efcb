use super::{ClusterApi, ClusterError, ClusterResult, Manifest, RESTARTED_AT_ANNOTATION};
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
use kube::{
    api::{
        AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams,
    },
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::fmt::Debug;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// Field manager used for server-side apply when none is given.
pub const DEFAULT_FIELD_MANAGER: &str = "ws-controller";

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => {
                let message = response.message;
                match (response.code, response.reason.as_str()) {
                    (404, _) => ClusterError::NotFound(message),
                    (409, "AlreadyExists") => ClusterError::AlreadyExists(message),
                    (409, _) => ClusterError::Conflict(message),
                    (400, _) | (422, _) => ClusterError::Invalid(message),
                    _ => ClusterError::Api(message),
                }
            }
            other => ClusterError::Api(other.to_string()),
        }
    }
}

/// [`ClusterApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connects with the in-cluster service account, falling back to the
    /// local kubeconfig for development.
    pub async fn try_default(field_manager: impl Into<String>) -> ClusterResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn server_side_apply<K>(&self, api: Api<K>, name: &str, object: &K) -> ClusterResult<()>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(name, &params, &Patch::Apply(object)).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(skip(self, manifest), fields(kind = manifest.kind()))]
    async fn apply(&self, manifest: &Manifest) -> ClusterResult<()> {
        let name = manifest.name()?;
        let namespace = manifest.namespace()?.unwrap_or_default();
        debug!(name, namespace, "applying manifest");

        match manifest {
            Manifest::Namespace(o) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                self.server_side_apply(api, name, o).await
            }
            Manifest::PersistentVolumeClaim(o) => {
                let api: Api<PersistentVolumeClaim> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::Secret(o) => {
                let api: Api<Secret> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::ServiceAccount(o) => {
                let api: Api<ServiceAccount> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::Role(o) => {
                let api: Api<Role> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::RoleBinding(o) => {
                let api: Api<RoleBinding> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::Deployment(o) => {
                let api: Api<Deployment> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::Service(o) => {
                let api: Api<Service> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
            Manifest::Ingress(o) => {
                let api: Api<Ingress> = self.namespaced(namespace);
                self.server_side_apply(api, name, o).await
            }
        }
    }

    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str) -> ClusterResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(err) => match ClusterError::from(err) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>> {
        let api: Api<Secret> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let api: Api<Secret> = self.namespaced(namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ConfigMap>> {
        let api: Api<ConfigMap> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap> {
        let api: Api<ConfigMap> = self.namespaced(namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap> {
        let name = config_map
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Invalid("ConfigMap without a name".into()))?;
        if config_map.metadata.resource_version.is_none() {
            return Err(ClusterError::Invalid(format!(
                "refusing unguarded replace of ConfigMap {name}"
            )));
        }
        let api: Api<ConfigMap> = self.namespaced(namespace);
        Ok(api.replace(name, &PostParams::default(), config_map).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Deployment>> {
        let api: Api<Deployment> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self))]
    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> ClusterResult<()> {
        let api: Api<Deployment> = self.namespaced(namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        restarted_at: &str,
    ) -> ClusterResult<()> {
        let api: Api<Deployment> = self.namespaced(namespace);
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: restarted_at
            } } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let api: Api<Pod> = self.namespaced(namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: i64,
    ) -> ClusterResult<String> {
        let api: Api<Pod> = self.namespaced(namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(tail_lines),
            ..LogParams::default()
        };
        Ok(api.logs(pod, &params).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> ClusterResult<Option<Service>> {
        let api: Api<Service> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, port), fields(port = port.port))]
    async fn add_service_port(
        &self,
        namespace: &str,
        name: &str,
        port: &ServicePort,
    ) -> ClusterResult<()> {
        let api: Api<Service> = self.namespaced(namespace);
        // Strategic merge on Service ports is keyed by port number, so the
        // patch appends or updates one entry and leaves the rest alone.
        let patch = json!({ "spec": { "ports": [port] } });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };
        api.patch(name, &params, &Patch::Strategic(&patch)).await?;
        Ok(())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> ClusterResult<Option<Ingress>> {
        let api: Api<Ingress> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, command))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<String> {
        let api: Api<Pod> = self.namespaced(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);

        let mut process = api.exec(pod, command.to_vec(), &params).await?;
        let status = process.take_status();

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| ClusterError::Exec(e.to_string()))?;
        }

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(ClusterError::Exec(
                        status.message.unwrap_or_else(|| command.join(" ")),
                    ));
                }
            }
        }

        process
            .join()
            .await
            .map_err(|e| ClusterError::Exec(e.to_string()))?;

        Ok(output)
    }
}
