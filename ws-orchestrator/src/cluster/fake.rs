//! In-memory cluster used by the test suites.
//!
//! Models the parts of API server behavior the workspace components rely on:
//! strict creates, resourceVersion-guarded replaces, cascading namespace
//! deletion and apply semantics that keep service ports owned by another
//! writer.

use super::{ClusterApi, ClusterError, ClusterResult, Manifest, RESTARTED_AT_ANNOTATION};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServicePort},
    networking::v1::Ingress,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    namespaces: BTreeMap<String, Namespace>,
    objects: BTreeMap<ObjectKey, Manifest>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    secrets: BTreeMap<(String, String), Secret>,
    pods: BTreeMap<String, Vec<Pod>>,
    exec_outputs: HashMap<(String, String), Result<String, String>>,
    exec_calls: Vec<(String, String, Vec<String>)>,
    pod_logs: HashMap<(String, String, String), String>,
    fail_apply: HashMap<String, VecDeque<ClusterError>>,
    replace_conflicts: u32,
    resource_version: u64,
    writes: u64,
}

impl FakeState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn require_namespace(&self, namespace: &str) -> ClusterResult<()> {
        if self.namespaces.contains_key(namespace) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!("namespace {namespace}")))
        }
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of successful mutating calls.
    pub async fn writes(&self) -> u64 {
        self.state.lock().await.writes
    }

    /// Makes the next apply of `kind` fail with `error`.
    pub async fn fail_next_apply(&self, kind: &str, error: ClusterError) {
        self.state
            .lock()
            .await
            .fail_apply
            .entry(kind.to_string())
            .or_default()
            .push_back(error);
    }

    /// Makes the next `count` config map replaces fail with a conflict, as if
    /// another writer got there first.
    pub async fn inject_replace_conflicts(&self, count: u32) {
        self.state.lock().await.replace_conflicts = count;
    }

    pub async fn insert_namespace(&self, namespace: Namespace) {
        let mut state = self.state.lock().await;
        let name = namespace.metadata.name.clone().unwrap_or_default();
        state.namespaces.insert(name, namespace);
    }

    pub async fn insert_secret(&self, namespace: &str, secret: Secret) {
        let mut state = self.state.lock().await;
        let name = secret.metadata.name.clone().unwrap_or_default();
        state.secrets.insert((namespace.to_string(), name), secret);
    }

    pub async fn insert_pod(&self, namespace: &str, pod: Pod) {
        let mut state = self.state.lock().await;
        state.pods.entry(namespace.to_string()).or_default().push(pod);
    }

    pub async fn clear_pods(&self, namespace: &str) {
        self.state.lock().await.pods.remove(namespace);
    }

    /// Stubs the output of `exec` for commands whose program is `program`.
    pub async fn set_exec_output(&self, container: &str, program: &str, output: Result<String, String>) {
        self.state
            .lock()
            .await
            .exec_outputs
            .insert((container.to_string(), program.to_string()), output);
    }

    /// Stubs the full log of `container` in `pod`.
    pub async fn set_pod_logs(&self, namespace: &str, pod: &str, container: &str, logs: &str) {
        self.state.lock().await.pod_logs.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            logs.to_string(),
        );
    }

    pub async fn exec_calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.state.lock().await.exec_calls.clone()
    }

    pub async fn namespace_names(&self) -> Vec<String> {
        self.state.lock().await.namespaces.keys().cloned().collect()
    }

    pub async fn object_names(&self, namespace: &str, kind: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .objects
            .keys()
            .filter(|(k, ns, _)| k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect();
        if kind == "Secret" {
            names.extend(
                state
                    .secrets
                    .keys()
                    .filter(|(ns, _)| ns == namespace)
                    .map(|(_, name)| name.clone()),
            );
            names.sort();
            names.dedup();
        }
        if kind == "ConfigMap" {
            names.extend(
                state
                    .config_maps
                    .keys()
                    .filter(|(ns, _)| ns == namespace)
                    .map(|(_, name)| name.clone()),
            );
        }
        names
    }

    pub async fn object(&self, namespace: &str, kind: &str, name: &str) -> Option<Manifest> {
        self.state
            .lock()
            .await
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every object left that is scoped to `namespace`, as `kind/name`.
    pub async fn namespaced_objects(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut out: Vec<String> = state
            .objects
            .keys()
            .filter(|(_, ns, _)| ns == namespace)
            .map(|(kind, _, name)| format!("{kind}/{name}"))
            .collect();
        out.extend(
            state
                .secrets
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .map(|(_, name)| format!("Secret/{name}")),
        );
        out.extend(
            state
                .config_maps
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .map(|(_, name)| format!("ConfigMap/{name}")),
        );
        out.extend(
            state
                .pods
                .get(namespace)
                .into_iter()
                .flatten()
                .map(|p| format!("Pod/{}", p.metadata.name.clone().unwrap_or_default())),
        );
        out.sort();
        out.dedup();
        out
    }
}

fn service_ports(service: &Service) -> Vec<ServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default()
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| {
            let mut parts = term.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            match parts.next() {
                Some(value) => labels.and_then(|l| l.get(key)).is_some_and(|v| v == value),
                None => labels.is_some_and(|l| l.contains_key(key)),
            }
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, manifest: &Manifest) -> ClusterResult<()> {
        let mut state = self.state.lock().await;

        if let Some(err) = state
            .fail_apply
            .get_mut(manifest.kind())
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let name = manifest.name()?.to_string();
        match manifest {
            Manifest::Namespace(ns) => {
                let mut ns = ns.clone();
                if let Some(existing) = state.namespaces.get(&name) {
                    ns.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
                    ns.status = existing.status.clone();
                }
                state.namespaces.insert(name, ns);
            }
            Manifest::Secret(secret) => {
                let namespace = manifest.namespace()?.unwrap_or_default().to_string();
                state.require_namespace(&namespace)?;
                state.secrets.insert((namespace, name), secret.clone());
            }
            other => {
                let namespace = other.namespace()?.unwrap_or_default().to_string();
                state.require_namespace(&namespace)?;
                let key = (other.kind().to_string(), namespace, name);
                let mut incoming = other.clone();

                // Ports added by another field manager survive a re-apply.
                if let (Manifest::Service(new_svc), Some(Manifest::Service(old_svc))) =
                    (&mut incoming, state.objects.get(&key))
                {
                    let mut ports = service_ports(new_svc);
                    for port in service_ports(old_svc) {
                        if !ports.iter().any(|p| p.port == port.port) {
                            ports.push(port);
                        }
                    }
                    if let Some(spec) = new_svc.spec.as_mut() {
                        spec.ports = Some(ports);
                    }
                }

                if let Manifest::Deployment(new_dep) = &mut incoming {
                    match state.objects.get(&key) {
                        Some(Manifest::Deployment(old)) => {
                            new_dep.metadata.creation_timestamp =
                                old.metadata.creation_timestamp.clone();
                        }
                        _ => {
                            new_dep.metadata.creation_timestamp = Some(
                                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                                    chrono::Utc::now(),
                                ),
                            );
                        }
                    }
                }

                state.objects.insert(key, incoming);
            }
        }
        state.writes += 1;
        Ok(())
    }

    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<Namespace>> {
        let state = self.state.lock().await;
        Ok(state
            .namespaces
            .values()
            .filter(|ns| matches_selector(ns.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        Ok(self.state.lock().await.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let name = namespace
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("Namespace without a name".into()))?;
        if state.namespaces.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(format!("namespace {name}")));
        }
        let mut namespace = namespace.clone();
        namespace.metadata.creation_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        state.namespaces.insert(name, namespace);
        state.writes += 1;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<bool> {
        let mut state = self.state.lock().await;
        if state.namespaces.remove(name).is_none() {
            return Ok(false);
        }
        state.objects.retain(|(_, ns, _), _| ns != name);
        state.config_maps.retain(|(ns, _), _| ns != name);
        state.secrets.retain(|(ns, _), _| ns != name);
        state.pods.remove(name);
        state.writes += 1;
        Ok(true)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>> {
        let state = self.state.lock().await;
        Ok(state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        state.require_namespace(namespace)?;
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("Secret without a name".into()))?;
        let key = (namespace.to_string(), name.clone());
        if state.secrets.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("secret {name}")));
        }
        state.secrets.insert(key, secret.clone());
        state.writes += 1;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ConfigMap>> {
        let state = self.state.lock().await;
        Ok(state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap> {
        let mut state = self.state.lock().await;
        state.require_namespace(namespace)?;
        let name = config_map
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("ConfigMap without a name".into()))?;
        let key = (namespace.to_string(), name.clone());
        if state.config_maps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("configmap {name}")));
        }
        let mut stored = config_map.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.next_version());
        state.config_maps.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> ClusterResult<ConfigMap> {
        let mut state = self.state.lock().await;
        let name = config_map
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("ConfigMap without a name".into()))?;

        if state.replace_conflicts > 0 {
            state.replace_conflicts -= 1;
            // Simulate the competing write by bumping the stored version.
            let version = state.next_version();
            if let Some(current) = state
                .config_maps
                .get_mut(&(namespace.to_string(), name.clone()))
            {
                current.metadata.resource_version = Some(version);
            }
            return Err(ClusterError::Conflict(format!("configmap {name} was modified")));
        }

        let key = (namespace.to_string(), name.clone());
        let current_version = state
            .config_maps
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {name}")))?
            .metadata
            .resource_version
            .clone();
        if config_map.metadata.resource_version != current_version {
            return Err(ClusterError::Conflict(format!("configmap {name} was modified")));
        }

        let mut stored = config_map.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.config_maps.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Deployment>> {
        let state = self.state.lock().await;
        match state.objects.get(&(
            "Deployment".to_string(),
            namespace.to_string(),
            name.to_string(),
        )) {
            Some(Manifest::Deployment(d)) => Ok(Some(d.clone())),
            _ => Ok(None),
        }
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let key = (
            "Deployment".to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        match state.objects.get_mut(&key) {
            Some(Manifest::Deployment(d)) => {
                d.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            _ => return Err(ClusterError::NotFound(format!("deployment {name}"))),
        }
        state.writes += 1;
        Ok(())
    }

    async fn restart_deployment(
        &self,
        namespace: &str,
        name: &str,
        restarted_at: &str,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let key = (
            "Deployment".to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        match state.objects.get_mut(&key) {
            Some(Manifest::Deployment(d)) => {
                d.spec
                    .get_or_insert_with(Default::default)
                    .template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(
                        RESTARTED_AT_ANNOTATION.to_string(),
                        restarted_at.to_string(),
                    );
            }
            _ => return Err(ClusterError::NotFound(format!("deployment {name}"))),
        }
        state.writes += 1;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: i64,
    ) -> ClusterResult<String> {
        let state = self.state.lock().await;
        let exists = state
            .pods
            .get(namespace)
            .into_iter()
            .flatten()
            .any(|p| p.metadata.name.as_deref() == Some(pod));
        if !exists {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        }
        let logs = state
            .pod_logs
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .map(String::as_str)
            .unwrap_or_default();
        let lines: Vec<&str> = logs.lines().collect();
        let keep = usize::try_from(tail_lines).unwrap_or(0).min(lines.len());
        Ok(lines[lines.len() - keep..]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let state = self.state.lock().await;
        Ok(state
            .pods
            .get(namespace)
            .into_iter()
            .flatten()
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> ClusterResult<Option<Service>> {
        let state = self.state.lock().await;
        match state.objects.get(&(
            "Service".to_string(),
            namespace.to_string(),
            name.to_string(),
        )) {
            Some(Manifest::Service(s)) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn add_service_port(
        &self,
        namespace: &str,
        name: &str,
        port: &ServicePort,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        let key = (
            "Service".to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        let Some(Manifest::Service(service)) = state.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(format!("service {name}")));
        };
        let spec = service.spec.get_or_insert_with(Default::default);
        let ports = spec.ports.get_or_insert_with(Vec::new);
        match ports.iter_mut().find(|p| p.port == port.port) {
            Some(existing) => *existing = port.clone(),
            None => ports.push(port.clone()),
        }
        state.writes += 1;
        Ok(())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> ClusterResult<Option<Ingress>> {
        let state = self.state.lock().await;
        match state.objects.get(&(
            "Ingress".to_string(),
            namespace.to_string(),
            name.to_string(),
        )) {
            Some(Manifest::Ingress(i)) => Ok(Some(i.clone())),
            _ => Ok(None),
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> ClusterResult<String> {
        let mut state = self.state.lock().await;
        let exists = state
            .pods
            .get(namespace)
            .into_iter()
            .flatten()
            .any(|p| p.metadata.name.as_deref() == Some(pod));
        if !exists {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        }
        state
            .exec_calls
            .push((pod.to_string(), container.to_string(), command.to_vec()));
        let program = command.first().cloned().unwrap_or_default();
        match state.exec_outputs.get(&(container.to_string(), program.clone())) {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(msg)) => Err(ClusterError::Exec(msg.clone())),
            None => Err(ClusterError::Exec(format!("{program}: command not found"))),
        }
    }
}
