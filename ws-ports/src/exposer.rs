use crate::probe::{CommandRunner, LocalRunner, PodExecRunner, ProbeChain};
use crate::route;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use ws_orchestrator::cluster::{ClusterApi, Manifest};
use ws_orchestrator::error::Result;
use ws_orchestrator::{naming, resources, StateStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExposerConfig {
    pub namespace: String,
    pub subdomain: String,
    pub domain: String,
    pub system_namespace: String,
    pub tls_secret: String,
    /// Pod to exec probes in; the primary workspace pod when unset.
    pub pod_name: Option<String>,
    pub poll_interval: Duration,
    /// Also probe from this process when exec finds nothing.
    pub local_fallback: bool,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub discovered: Vec<u16>,
    /// Ports that needed at least one write this pass.
    pub exposed: Vec<u16>,
    pub failed: Vec<u16>,
}

pub struct PortExposer {
    cluster: Arc<dyn ClusterApi>,
    store: StateStore,
    chain: ProbeChain,
    config: ExposerConfig,
}

impl PortExposer {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ExposerConfig) -> Self {
        let mut runners: Vec<Box<dyn CommandRunner>> = vec![Box::new(PodExecRunner::new(
            cluster.clone(),
            &config.namespace,
            config.pod_name.clone(),
        ))];
        if config.local_fallback {
            runners.push(Box::new(LocalRunner));
        }
        Self::with_chain(cluster, config, ProbeChain::standard(runners))
    }

    pub fn with_chain(cluster: Arc<dyn ClusterApi>, config: ExposerConfig, chain: ProbeChain) -> Self {
        Self {
            store: StateStore::new(cluster.clone()),
            cluster,
            chain,
            config,
        }
    }

    pub fn config(&self) -> &ExposerConfig {
        &self.config
    }

    /// Poll forever. Failures are logged and retried on the next cycle.
    pub async fn run(&self) {
        info!(
            namespace = %self.config.namespace,
            interval_secs = self.config.poll_interval.as_secs(),
            "port exposer started"
        );
        loop {
            let report = self.poll_once().await;
            if !report.exposed.is_empty() || !report.failed.is_empty() {
                info!(
                    exposed = ?report.exposed,
                    failed = ?report.failed,
                    "port discovery pass"
                );
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One discovery pass: find listening ports and expose each one that is
    /// not fully exposed yet.
    pub async fn poll_once(&self) -> PollReport {
        let discovery = self.chain.discover().await;
        let mut report = PollReport {
            discovered: discovery.ports.clone(),
            ..Default::default()
        };
        if discovery.ports.is_empty() {
            debug!("no qualifying ports");
            return report;
        }
        debug!(source = ?discovery.source, ports = ?discovery.ports, "ports discovered");

        for port in discovery.ports {
            match self.expose_port(port).await {
                Ok(true) => report.exposed.push(port),
                Ok(false) => {}
                Err(err) => {
                    warn!(port, error = %err, "failed to expose port");
                    report.failed.push(port);
                }
            }
        }
        report
    }

    /// Make `port` reachable at its public host. Steps already done are
    /// skipped, so a port left half-exposed by an earlier failure is
    /// completed. Returns whether anything was written.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn expose_port(&self, port: u16) -> Result<bool> {
        if !naming::is_exposable_port(port) {
            return Ok(false);
        }
        let namespace = self.config.namespace.as_str();
        let host = naming::port_host(&self.config.subdomain, port, &self.config.domain);
        let url = route::public_url(&self.config.subdomain, &self.config.domain, port);

        let has_route = self
            .cluster
            .get_ingress(namespace, &naming::route_name(port))
            .await?
            .is_some_and(|ingress| route::routes_host(&ingress, &host));
        let has_service_port = self
            .cluster
            .get_service(namespace, naming::SERVICE_NAME)
            .await?
            .is_some_and(|service| route::service_exposes(&service, port));
        let has_mapping = self
            .store
            .descriptor(namespace)
            .await?
            .is_some_and(|d| d.port_mappings.contains_key(&port));

        if has_route && has_service_port && has_mapping {
            return Ok(false);
        }

        if !has_route {
            if let Err(err) = resources::ensure_tls_secret(
                self.cluster.as_ref(),
                &self.config.system_namespace,
                &self.config.tls_secret,
                namespace,
            )
            .await
            {
                warn!(error = %err, "TLS secret unavailable; route will use the default certificate");
            }
            let ingress = route::port_ingress(
                namespace,
                &self.config.subdomain,
                &self.config.domain,
                port,
                &self.config.tls_secret,
            );
            self.cluster.apply(&Manifest::Ingress(ingress)).await?;
        }

        if !has_service_port {
            self.cluster
                .add_service_port(namespace, naming::SERVICE_NAME, &route::port_service_entry(port))
                .await?;
        }

        if !has_mapping {
            self.store.add_port_mapping(namespace, port, &url).await?;
        }

        info!(port, %url, "port exposed");
        Ok(true)
    }
}
