//! Listening-port discovery.
//!
//! Each [`PortProbe`] knows one command that lists listening TCP sockets and
//! how to read its output. A [`ProbeChain`] tries its probes in order against
//! each [`CommandRunner`] (the workspace container first, then the local
//! process) and takes the first non-empty answer.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use ws_orchestrator::cluster::{ClusterApi, ClusterError};
use ws_orchestrator::naming;
use ws_orchestrator::workspace::primary_pod;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{0}")]
    Cluster(#[from] ClusterError),

    #[error("failed to spawn: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` exited with {status}")]
    Status { command: String, status: String },

    #[error("no workspace pod to exec into")]
    NoPod,
}

/// Somewhere a probe command can run.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, command: &[String]) -> Result<String, ProbeError>;
}

/// Runs commands in the workspace container through the pod exec API.
pub struct PodExecRunner {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    container: String,
    pod: Option<String>,
}

impl PodExecRunner {
    /// `pod` pins the target pod; otherwise the primary workspace pod is
    /// looked up on every run.
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, pod: Option<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            container: naming::WORKSPACE_CONTAINER.to_string(),
            pod,
        }
    }

    async fn target_pod(&self) -> Result<String, ProbeError> {
        if let Some(pod) = &self.pod {
            return Ok(pod.clone());
        }
        let pods = self
            .cluster
            .list_pods(&self.namespace, naming::WORKSPACE_POD_SELECTOR)
            .await?;
        primary_pod(&pods)
            .and_then(|p| p.metadata.name.clone())
            .ok_or(ProbeError::NoPod)
    }
}

#[async_trait]
impl CommandRunner for PodExecRunner {
    fn name(&self) -> &str {
        "pod-exec"
    }

    async fn run(&self, command: &[String]) -> Result<String, ProbeError> {
        let pod = self.target_pod().await?;
        Ok(self
            .cluster
            .exec(&self.namespace, &pod, &self.container, command)
            .await?)
    }
}

/// Runs commands in this process's own network namespace.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, command: &[String]) -> Result<String, ProbeError> {
        let Some((program, args)) = command.split_first() else {
            return Ok(String::new());
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProbeError::Status {
                command: command.join(" "),
                status: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// One way of listing listening TCP ports.
pub trait PortProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn command(&self) -> Vec<String>;
    /// Every listening port found in `output`. Unreadable tokens are dropped.
    fn parse(&self, output: &str) -> Vec<u16>;
}

fn port_after_colon(address: &str) -> Option<u16> {
    address.rsplit_once(':')?.1.parse().ok()
}

/// `ss -tlnH`
pub struct SsProbe;

impl PortProbe for SsProbe {
    fn name(&self) -> &'static str {
        "ss"
    }

    fn command(&self) -> Vec<String> {
        vec!["ss".to_string(), "-tlnH".to_string()]
    }

    fn parse(&self, output: &str) -> Vec<u16> {
        output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                // State Recv-Q Send-Q Local Peer
                let local = if fields.first() == Some(&"LISTEN") {
                    fields.get(3)
                } else {
                    fields.get(2)
                };
                port_after_colon(local?)
            })
            .collect()
    }
}

/// `netstat -tln`
pub struct NetstatProbe;

impl PortProbe for NetstatProbe {
    fn name(&self) -> &'static str {
        "netstat"
    }

    fn command(&self) -> Vec<String> {
        vec!["netstat".to_string(), "-tln".to_string()]
    }

    fn parse(&self, output: &str) -> Vec<u16> {
        output
            .lines()
            .filter(|line| line.starts_with("tcp"))
            .filter_map(|line| port_after_colon(line.split_whitespace().nth(3)?))
            .collect()
    }
}

/// `/proc/net/tcp` and `/proc/net/tcp6`
pub struct ProcNetProbe;

const TCP_LISTEN_STATE: &str = "0A";

impl PortProbe for ProcNetProbe {
    fn name(&self) -> &'static str {
        "proc-net-tcp"
    }

    fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat /proc/net/tcp /proc/net/tcp6 2>/dev/null".to_string(),
        ]
    }

    fn parse(&self, output: &str) -> Vec<u16> {
        output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.get(3) != Some(&TCP_LISTEN_STATE) {
                    return None;
                }
                let (_, hex) = fields.get(1)?.rsplit_once(':')?;
                u16::from_str_radix(hex, 16).ok()
            })
            .collect()
    }
}

/// Ports that may be published, sorted and without duplicates.
pub fn qualifying_ports(raw: &[u16]) -> Vec<u16> {
    raw.iter()
        .copied()
        .filter(|p| naming::is_exposable_port(*p))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// `probe@runner` that produced the answer.
    pub source: Option<String>,
    pub ports: Vec<u16>,
}

pub struct ProbeChain {
    probes: Vec<Box<dyn PortProbe>>,
    runners: Vec<Box<dyn CommandRunner>>,
}

impl ProbeChain {
    pub fn new(probes: Vec<Box<dyn PortProbe>>, runners: Vec<Box<dyn CommandRunner>>) -> Self {
        Self { probes, runners }
    }

    /// ss, then netstat, then /proc/net/tcp over the given runners.
    pub fn standard(runners: Vec<Box<dyn CommandRunner>>) -> Self {
        Self::new(
            vec![
                Box::new(SsProbe),
                Box::new(NetstatProbe),
                Box::new(ProcNetProbe),
            ],
            runners,
        )
    }

    pub async fn discover(&self) -> Discovery {
        for probe in &self.probes {
            let command = probe.command();
            for runner in &self.runners {
                let raw = match runner.run(&command).await {
                    Ok(output) => probe.parse(&output),
                    Err(err) => {
                        debug!(probe = probe.name(), runner = runner.name(), error = %err, "probe failed");
                        continue;
                    }
                };
                if raw.is_empty() {
                    continue;
                }
                return Discovery {
                    source: Some(format!("{}@{}", probe.name(), runner.name())),
                    ports: qualifying_ports(&raw),
                };
            }
        }
        Discovery::default()
    }
}
