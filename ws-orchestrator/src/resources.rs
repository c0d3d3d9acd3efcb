//! Desired-state manifests for one workspace namespace.

use crate::cluster::{ClusterApi, Manifest};
use crate::controller::ControllerConfig;
use crate::error::{OrchestratorError, Result};
use crate::naming;
use crate::workspace::{ImageSpec, WorkspaceSpec};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
    core::v1::{
        Container, ContainerPort, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector,
        PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
        PodSpec, PodTemplateSpec, Secret, SecretKeySelector, Service, ServiceAccount,
        ServicePort, ServiceSpec, TCPSocketAction, Probe, Volume, VolumeMount,
        VolumeResourceRequirements,
    },
    networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity,
    apis::meta::v1::{LabelSelector, ObjectMeta},
    util::intstr::IntOrString,
};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const INGRESS_CLASS: &str = "nginx";
/// Long-lived editor and dev-server connections (websockets included).
pub const PROXY_TIMEOUT_SECS: &str = "3600";

const WORKSPACES_MOUNT: &str = "/workspaces";
const CONFIG_MOUNT: &str = "/config";
const DATA_VOLUME: &str = "data";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn workspace_labels(spec: &WorkspaceSpec) -> BTreeMap<String, String> {
    labels(&[
        (naming::APP_LABEL, naming::APP_WORKSPACE),
        (naming::WORKSPACE_ID_LABEL, &spec.identity.id),
    ])
}

fn pod_selector(spec: &WorkspaceSpec) -> BTreeMap<String, String> {
    labels(&[
        (naming::COMPONENT_LABEL, naming::WORKSPACE_CONTAINER),
        (naming::WORKSPACE_ID_LABEL, &spec.identity.id),
    ])
}

fn meta(spec: &WorkspaceSpec, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(spec.identity.namespace.clone()),
        labels: Some(workspace_labels(spec)),
        ..Default::default()
    }
}

pub fn namespace(spec: &WorkspaceSpec) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(spec.identity.namespace.clone()),
            labels: Some(workspace_labels(spec)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn volume_claim(spec: &WorkspaceSpec, config: &ControllerConfig) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(spec, naming::PVC_NAME),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            storage_class_name: Some(config.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(config.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn password_secret(spec: &WorkspaceSpec) -> Secret {
    Secret {
        metadata: meta(spec, naming::SECRET_NAME),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            naming::PASSWORD_KEY.to_string(),
            ByteString(spec.identity.password.clone().into_bytes()),
        )])),
        ..Default::default()
    }
}

/// Reads the password back out of a workspace secret.
pub fn secret_password(secret: &Secret) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(naming::PASSWORD_KEY)) {
        return String::from_utf8(bytes.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(naming::PASSWORD_KEY))
        .cloned()
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Service account, role and binding for the port-exposer sidecar. The role
/// only reaches into the workspace's own namespace.
pub fn exposer_rbac(spec: &WorkspaceSpec) -> (ServiceAccount, Role, RoleBinding) {
    let account = ServiceAccount {
        metadata: meta(spec, naming::EXPOSER_ACCOUNT),
        ..Default::default()
    };
    let role = Role {
        metadata: meta(spec, naming::EXPOSER_ACCOUNT),
        rules: Some(vec![
            rule("", &["pods"], &["get", "list"]),
            rule("", &["pods/exec"], &["create", "get"]),
            rule("", &["services"], &["get", "patch"]),
            rule("", &["configmaps"], &["get", "create", "update"]),
            rule("", &["secrets"], &["get", "create"]),
            rule(
                "networking.k8s.io",
                &["ingresses"],
                &["get", "create", "patch"],
            ),
        ]),
    };
    let binding = RoleBinding {
        metadata: meta(spec, naming::EXPOSER_ACCOUNT),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: naming::EXPOSER_ACCOUNT.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: naming::EXPOSER_ACCOUNT.to_string(),
            namespace: Some(spec.identity.namespace.clone()),
            ..Default::default()
        }]),
    };
    (account, role, binding)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn env_from_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from_secret(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: naming::SECRET_NAME.to_string(),
                key: naming::PASSWORD_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(path: &str, sub_path: &str) -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: path.to_string(),
        sub_path: Some(sub_path.to_string()),
        ..Default::default()
    }
}

fn tcp_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// Clones each repository once; a directory left by an earlier start is kept.
pub fn clone_script(spec: &WorkspaceSpec) -> String {
    let mut script = String::from("set -e\n");
    for repo in &spec.source.repositories {
        let dir = format!("{WORKSPACES_MOUNT}/{}", repo.directory());
        let branch = repo
            .branch
            .as_deref()
            .map(|b| format!("--branch {} ", shell_quote(b)))
            .unwrap_or_default();
        script.push_str(&format!(
            "if [ ! -d {dir}/.git ]; then git clone {branch}{url} {dir}; fi\n",
            dir = shell_quote(&dir),
            url = shell_quote(&repo.url),
        ));
    }
    script
}

/// Tag the build-from-URL image is pushed to and run from.
pub fn built_image(spec: &WorkspaceSpec, config: &ControllerConfig) -> String {
    format!(
        "{}/workspace-images:{}",
        config.image_registry.trim_end_matches('/'),
        spec.identity.namespace
    )
}

fn workspace_image(spec: &WorkspaceSpec, config: &ControllerConfig) -> String {
    match &spec.source.image {
        ImageSpec::Default => config.default_image.clone(),
        ImageSpec::Named(name) => name.clone(),
        ImageSpec::BuildFromUrl(_) => built_image(spec, config),
    }
}

fn init_containers(spec: &WorkspaceSpec, config: &ControllerConfig) -> Vec<Container> {
    let mut containers = Vec::new();
    if let ImageSpec::BuildFromUrl(url) = &spec.source.image {
        containers.push(Container {
            name: naming::BUILD_CONTAINER.to_string(),
            image: Some(config.build_image.clone()),
            args: Some(vec![
                format!("--context={url}"),
                format!("--destination={}", built_image(spec, config)),
                "--insecure".to_string(),
                "--skip-tls-verify-pull".to_string(),
            ]),
            ..Default::default()
        });
    }
    if !spec.source.repositories.is_empty() {
        containers.push(Container {
            name: naming::CLONE_CONTAINER.to_string(),
            image: Some(config.git_image.clone()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![clone_script(spec)]),
            volume_mounts: Some(vec![mount(WORKSPACES_MOUNT, "workspaces")]),
            ..Default::default()
        });
    }
    containers
}

fn workspace_container(spec: &WorkspaceSpec, config: &ControllerConfig) -> Container {
    let identity = &spec.identity;
    Container {
        name: naming::WORKSPACE_CONTAINER.to_string(),
        image: Some(workspace_image(spec, config)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            tcp_port("http", naming::BASE_PORT),
            tcp_port("health", naming::HEALTH_PORT),
        ]),
        env: Some(vec![
            env("PUID", "1000"),
            env("PGID", "1000"),
            env("TZ", "UTC"),
            env("DEFAULT_WORKSPACE", WORKSPACES_MOUNT),
            env("PORT", naming::BASE_PORT.to_string()),
            env(
                "VSCODE_PROXY_URI",
                format!(
                    "https://{}-{{{{port}}}}.{}/",
                    identity.subdomain, config.domain
                ),
            ),
            env("POD_URL", format!("{}/", identity.url())),
            env_from_secret("PASSWORD"),
        ]),
        volume_mounts: Some(vec![
            mount(CONFIG_MOUNT, "config"),
            mount(WORKSPACES_MOUNT, "workspaces"),
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(naming::BASE_PORT)),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn exposer_container(spec: &WorkspaceSpec, config: &ControllerConfig) -> Container {
    Container {
        name: naming::EXPOSER_CONTAINER.to_string(),
        image: Some(config.exposer_image.clone()),
        env: Some(vec![
            env_from_field("WORKSPACE_NAMESPACE", "metadata.namespace"),
            env_from_field("POD_NAME", "metadata.name"),
            env("WS_SUBDOMAIN", spec.identity.subdomain.clone()),
            env("WS_DOMAIN", config.domain.clone()),
            env("WS_SYSTEM_NAMESPACE", config.system_namespace.clone()),
            env("WS_TLS_SECRET", config.tls_secret.clone()),
            env(
                "WS_POLL_INTERVAL",
                config.exposer_poll_interval_secs.to_string(),
            ),
        ]),
        ..Default::default()
    }
}

pub fn deployment(spec: &WorkspaceSpec, config: &ControllerConfig) -> Deployment {
    let mut pod_labels = pod_selector(spec);
    pod_labels.insert(
        naming::APP_LABEL.to_string(),
        naming::APP_WORKSPACE.to_string(),
    );
    let init = init_containers(spec, config);

    Deployment {
        metadata: meta(spec, naming::DEPLOYMENT_NAME),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_selector(spec)),
                ..Default::default()
            },
            // One pod at a time owns the volume.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(naming::EXPOSER_ACCOUNT.to_string()),
                    init_containers: (!init.is_empty()).then_some(init),
                    containers: vec![
                        workspace_container(spec, config),
                        exposer_container(spec, config),
                    ],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: naming::PVC_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub fn service(spec: &WorkspaceSpec) -> Service {
    Service {
        metadata: meta(spec, naming::SERVICE_NAME),
        spec: Some(ServiceSpec {
            selector: Some(pod_selector(spec)),
            ports: Some(vec![
                service_port("http", naming::BASE_PORT),
                service_port("health", naming::HEALTH_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// TLS-terminated ingress routing `host` to `port` of the workspace service.
pub fn host_ingress(
    namespace: &str,
    name: &str,
    host: &str,
    port: u16,
    tls_secret: &str,
    labels: BTreeMap<String, String>,
) -> Ingress {
    let annotations = BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/proxy-read-timeout".to_string(),
            PROXY_TIMEOUT_SECS.to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-send-timeout".to_string(),
            PROXY_TIMEOUT_SECS.to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-http-version".to_string(),
            "1.1".to_string(),
        ),
    ]);

    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host.to_string()]),
                secret_name: Some(tls_secret.to_string()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: naming::SERVICE_NAME.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(i32::from(port)),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn base_ingress(spec: &WorkspaceSpec, config: &ControllerConfig) -> Ingress {
    host_ingress(
        &spec.identity.namespace,
        naming::INGRESS_NAME,
        &spec.identity.fqdn,
        naming::BASE_PORT,
        &config.tls_secret,
        workspace_labels(spec),
    )
}

/// Applied in order by reconcile. Records and the TLS copy are handled
/// separately because they are create-if-absent.
pub fn manifests(spec: &WorkspaceSpec, config: &ControllerConfig) -> Vec<Manifest> {
    let (account, role, binding) = exposer_rbac(spec);
    vec![
        Manifest::PersistentVolumeClaim(volume_claim(spec, config)),
        Manifest::ServiceAccount(account),
        Manifest::Role(role),
        Manifest::RoleBinding(binding),
        Manifest::Deployment(deployment(spec, config)),
        Manifest::Service(service(spec)),
        Manifest::Ingress(base_ingress(spec, config)),
    ]
}

/// Copies the wildcard TLS secret from the system namespace into `target`
/// unless a copy is already there. Existing copies are never refreshed.
/// Returns whether a copy was made.
pub async fn ensure_tls_secret(
    cluster: &dyn ClusterApi,
    system_namespace: &str,
    secret_name: &str,
    target: &str,
) -> Result<bool> {
    if cluster.get_secret(target, secret_name).await?.is_some() {
        debug!(namespace = target, secret = secret_name, "TLS secret already present");
        return Ok(false);
    }

    let source = cluster
        .get_secret(system_namespace, secret_name)
        .await?
        .ok_or_else(|| {
            OrchestratorError::NotFound(format!("secret {system_namespace}/{secret_name}"))
        })?;

    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(target.to_string()),
            labels: Some(labels(&[(naming::APP_LABEL, naming::APP_WORKSPACE)])),
            ..Default::default()
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        ..Default::default()
    };

    match cluster.create_secret(target, &copy).await {
        Ok(()) => {
            info!(namespace = target, secret = secret_name, "copied TLS secret");
            Ok(true)
        }
        Err(err) if err.is_already_exists() => Ok(false),
        Err(err) => Err(err.into()),
    }
}
